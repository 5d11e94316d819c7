//! Error types for the RPC layer.

use choria_client::ClientError;
use thiserror::Error;

/// Errors that can occur while performing RPC requests.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Invalid request options.
    #[error("invalid request options: {msg}")]
    Config {
        /// Description of the problem.
        msg: String,
    },

    /// Discovery did not complete.
    #[error("discovery failed: {reason}")]
    Discovery {
        /// Why discovery failed.
        reason: String,
    },

    /// Discovery completed without finding any node.
    #[error("no targets were discovered")]
    NoTargets,

    /// Unknown discovery method requested.
    #[error("unknown discovery method {method}")]
    UnknownDiscoveryMethod {
        /// The requested method.
        method: String,
    },

    /// Target limiting could not be applied.
    #[error("could not limit targets: {reason}")]
    Limit {
        /// Why limiting failed.
        reason: String,
    },

    /// A reply could not be understood.
    #[error("could not parse reply from {sender}: {reason}")]
    InvalidReply {
        /// Node the reply came from.
        sender: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A discovery callback aborted the request.
    #[error("request aborted: {reason}")]
    Aborted {
        /// Reason given by the callback.
        reason: String,
    },

    /// Publishing has not finished or never happened.
    #[error("publishing is not completed")]
    PublishIncomplete,

    /// The request has not finished or never started.
    #[error("request is not completed")]
    RequestIncomplete,

    /// Discovery was never performed.
    #[error("discovery was not performed")]
    DiscoveryNotPerformed,

    /// Network client error.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;
