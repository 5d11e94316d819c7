//! Abstract connection to the Choria network.
//!
//! Brokers, federation gateways and the in-memory broker used in tests all
//! implement [`Connector`]; [`ConnectorFactory`] creates named connections
//! on demand.

use crate::error::Result;
use crate::message::{ConnectorMessage, Message};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A connection to the Choria network.
///
/// Delivery is at-most-once per subscriber group member with no ordering
/// guarantee across subjects.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Subscribes to `subject`, delivering messages into `output` until
    /// `token` is cancelled or the connection closes.
    ///
    /// Subscribers sharing a non-empty `group` receive each message once
    /// between them.
    async fn queue_subscribe(
        &self,
        token: CancellationToken,
        name: &str,
        subject: &str,
        group: &str,
        output: mpsc::Sender<ConnectorMessage>,
    ) -> Result<()>;

    /// Publishes a request to every subject it addresses.
    async fn publish(&self, msg: &Message) -> Result<()>;

    /// Closes the connection, ending all its subscriptions.
    async fn close(&self);

    /// Name the connection was opened with.
    fn name(&self) -> &str;
}

/// Creates named connections to the Choria network.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    /// Opens a new connection called `name`.
    async fn connect(&self, name: &str) -> Result<Arc<dyn Connector>>;
}
