//! Client configuration.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings shared by every client created from a [`crate::Framework`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChoriaConfig {
    /// Identity this client publishes as, used in reply subjects.
    pub identity: String,
    /// Collective requests are sent to unless overridden.
    pub main_collective: String,
    /// All collectives this client may address.
    pub collectives: Vec<String>,
    /// Broadcast discovery timeout in seconds, also the base request timeout.
    pub discovery_timeout_secs: u64,
    /// Discovery method used when a request does not pick one.
    pub default_discovery_method: String,
    /// Target limiting method, `first` or `random`.
    pub rpc_limit_method: String,
    /// Capacity of the per-request reply queue.
    pub reply_queue_size: usize,
}

impl Default for ChoriaConfig {
    fn default() -> Self {
        Self {
            identity: String::from("localhost"),
            main_collective: String::from("mcollective"),
            collectives: vec![String::from("mcollective")],
            discovery_timeout_secs: 2,
            default_discovery_method: String::from("broadcast"),
            rpc_limit_method: String::from("first"),
            reply_queue_size: 100_000,
        }
    }
}

impl ChoriaConfig {
    /// Loads a configuration file, picking the format from the extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ChoriaConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                return Err(ClientError::Config {
                    msg: format!("unsupported config file extension: {}", ext),
                })
            }
        };

        config.validate()?;

        Ok(config)
    }

    /// Checks the settings are usable.
    pub fn validate(&self) -> Result<()> {
        if self.identity.is_empty() {
            return Err(ClientError::Config {
                msg: "identity cannot be empty".to_string(),
            });
        }

        if !self.collectives.contains(&self.main_collective) {
            return Err(ClientError::Config {
                msg: format!(
                    "main collective {} is not one of the configured collectives",
                    self.main_collective
                ),
            });
        }

        if self.discovery_timeout_secs == 0 {
            return Err(ClientError::Config {
                msg: "discovery timeout must be greater than zero".to_string(),
            });
        }

        if self.reply_queue_size == 0 {
            return Err(ClientError::Config {
                msg: "reply queue size must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    /// Discovery timeout as a duration.
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }
}
