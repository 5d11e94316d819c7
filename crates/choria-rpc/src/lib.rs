#![warn(missing_docs)]

//! Choria RPC layer: discovery, target limiting, batched fan-out requests,
//! reply classification and request statistics.

pub mod batch;
pub mod discovery;
pub mod error;
pub mod limit;
pub mod nodelist;
pub mod options;
pub mod reply;
pub mod rpc;
pub mod stats;

pub use discovery::{BroadcastDiscovery, Discoverer, DiscoveryOptions, StaticDiscovery};
pub use error::{Result, RpcError};
pub use limit::LimitMethod;
pub use nodelist::NodeList;
pub use options::{ReplyHandler, RequestOptions, RequestOptionsBuilder};
pub use reply::{parse_reply, RpcReply, StatusCode};
pub use rpc::{AgentMetadata, RequestClient, RequestResult, Rpc};
pub use stats::Stats;
