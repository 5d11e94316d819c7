//! Error types for the Choria network client.

use thiserror::Error;

/// Errors that can occur while talking to the Choria network.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Invalid client or framework configuration.
    #[error("invalid configuration: {msg}")]
    Config {
        /// Description of the problem.
        msg: String,
    },

    /// A connection could not be established.
    #[error("could not connect {name}: {reason}")]
    Connect {
        /// Connection name.
        name: String,
        /// Why the connection failed.
        reason: String,
    },

    /// Publishing a message failed.
    #[error("could not publish request {request_id}: {reason}")]
    Publish {
        /// Request the publish belonged to.
        request_id: String,
        /// Why the publish failed.
        reason: String,
    },

    /// Subscribing to a subject failed.
    #[error("could not subscribe to {subject}: {reason}")]
    Subscribe {
        /// Subject that was subscribed to.
        subject: String,
        /// Why the subscription failed.
        reason: String,
    },

    /// None of the reply receivers managed to subscribe.
    #[error("no reply receivers could subscribe to {subject}")]
    NoReceivers {
        /// Reply subject.
        subject: String,
    },

    /// The connection was closed.
    #[error("connection {name} is closed")]
    ConnectionClosed {
        /// Connection name.
        name: String,
    },

    /// A message failed validation.
    #[error("invalid message: {reason}")]
    InvalidMessage {
        /// What was wrong with the message.
        reason: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML configuration could not be parsed.
    #[error("configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
