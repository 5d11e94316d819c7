#![warn(missing_docs)]

//! Choria network client: message envelopes, connectors, in-memory broker,
//! and the single-shot publish/receive engine RPC clients are built on.

pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod framework;
pub mod memory;
pub mod message;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{Client, ClientOptions, Handler, PublishHook, ReplyMode};
pub use config::ChoriaConfig;
pub use connector::{Connector, ConnectorFactory};
pub use error::{ClientError, Result};
pub use framework::Framework;
pub use memory::{MemoryBroker, MemoryConnector};
pub use message::{ConnectorMessage, Filter, Message, Reply, RequestType};
