//! Application context shared by every client component.
//!
//! A [`Framework`] is built once at startup and handed to clients by `Arc`;
//! nothing in the client reaches for global state.

use crate::config::ChoriaConfig;
use crate::connector::{Connector, ConnectorFactory};
use crate::error::{ClientError, Result};
use crate::message::{Message, RequestType};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Configuration plus the network access used to build clients.
pub struct Framework {
    config: ChoriaConfig,
    factory: Arc<dyn ConnectorFactory>,
}

impl Framework {
    /// Creates a framework after validating `config`.
    pub fn new(config: ChoriaConfig, factory: Arc<dyn ConnectorFactory>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, factory })
    }

    /// Active configuration.
    pub fn config(&self) -> &ChoriaConfig {
        &self.config
    }

    /// Identity requests are published as.
    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Factory used for new connections.
    pub fn connector_factory(&self) -> Arc<dyn ConnectorFactory> {
        self.factory.clone()
    }

    /// Generates a new unique request id.
    pub fn new_request_id(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Builds a request for `agent` in `collective`.
    pub fn new_message(
        &self,
        payload: impl Into<String>,
        agent: &str,
        collective: &str,
        msg_type: RequestType,
    ) -> Result<Message> {
        self.check_collective(collective)?;

        let request_id = self.new_request_id();
        Message::new(payload, agent, collective, self.identity(), &request_id, msg_type)
    }

    /// Fails unless `collective` is one this client may address.
    pub fn check_collective(&self, collective: &str) -> Result<()> {
        if !self.config.collectives.iter().any(|c| c == collective) {
            return Err(ClientError::InvalidMessage {
                reason: format!("collective {} is not configured", collective),
            });
        }
        Ok(())
    }

    /// Opens a connection that is closed once `token` is cancelled.
    pub async fn new_connector(
        &self,
        token: &CancellationToken,
        name: &str,
    ) -> Result<Arc<dyn Connector>> {
        let conn = self.factory.connect(name).await?;
        close_on_cancel(token.clone(), conn.clone());
        Ok(conn)
    }
}

impl std::fmt::Debug for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framework")
            .field("config", &self.config)
            .finish()
    }
}

/// Spawns a task that closes `conn` when `token` is cancelled.
pub fn close_on_cancel(token: CancellationToken, conn: Arc<dyn Connector>) {
    tokio::spawn(async move {
        token.cancelled().await;
        debug!(connection = %conn.name(), "closing connection");
        conn.close().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    fn make_framework() -> Framework {
        let config = ChoriaConfig {
            identity: "admin.example.net".to_string(),
            collectives: vec!["mcollective".to_string(), "eu".to_string()],
            ..Default::default()
        };
        Framework::new(config, Arc::new(MemoryBroker::new())).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = ChoriaConfig {
            identity: String::new(),
            ..Default::default()
        };
        assert!(Framework::new(config, Arc::new(MemoryBroker::new())).is_err());
    }

    #[test]
    fn test_request_ids_are_unique() {
        let fw = make_framework();
        let a = fw.new_request_id();
        let b = fw.new_request_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(!a.contains('-'));
    }

    #[test]
    fn test_new_message_validates_collective() {
        let fw = make_framework();
        let msg = fw.new_message("{}", "package", "eu", RequestType::Direct).unwrap();
        assert_eq!(msg.collective(), "eu");
        assert_eq!(msg.sender_id(), "admin.example.net");

        assert!(fw.new_message("{}", "package", "asia", RequestType::Direct).is_err());
    }

    #[tokio::test]
    async fn test_new_connector_closes_on_cancel() {
        let broker = MemoryBroker::new();
        let fw = Framework::new(ChoriaConfig::default(), Arc::new(broker.clone())).unwrap();
        let token = CancellationToken::new();

        let conn = fw.new_connector(&token, "closer-test").await.unwrap();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        conn.queue_subscribe(CancellationToken::new(), "s", "a.b", "", tx)
            .await
            .unwrap();
        assert_eq!(broker.subscription_count("a.b"), 1);

        token.cancel();
        for _ in 0..50 {
            if broker.subscription_count("a.b") == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(broker.subscription_count("a.b"), 0);
    }
}
