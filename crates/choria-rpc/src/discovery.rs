//! Node discovery.
//!
//! Discoverers turn a [`Filter`] into a list of node identities. The
//! orchestrator looks them up by method name, `broadcast` being the one
//! every [`crate::Rpc`] has.

use crate::error::{Result, RpcError};
use async_trait::async_trait;
use choria_client::{Client, ClientOptions, Filter, Framework, Reply, ReplyMode, RequestType};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Agent answering discovery pings.
pub const DISCOVERY_AGENT: &str = "discovery";

/// Name of the broadcast discovery method.
pub const BROADCAST_METHOD: &str = "broadcast";

/// Receivers used by broadcast discovery.
const DISCOVERY_RECEIVERS: usize = 3;

/// Settings for one discovery run.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Collective to discover in.
    pub collective: String,
    /// How long to wait for nodes to answer.
    pub timeout: Duration,
    /// Base name for connections, empty for a generated one.
    pub connection_name: String,
}

/// Finds nodes matching a filter.
#[async_trait]
pub trait Discoverer: Send + Sync {
    /// Returns the identities of the nodes matching `filter`.
    async fn discover(
        &self,
        token: &CancellationToken,
        filter: &Filter,
        opts: &DiscoveryOptions,
    ) -> Result<Vec<String>>;
}

/// Discovers by broadcasting a ping and collecting whoever answers.
pub struct BroadcastDiscovery {
    fw: Arc<Framework>,
}

impl BroadcastDiscovery {
    /// Creates a broadcast discoverer.
    pub fn new(fw: Arc<Framework>) -> Self {
        Self { fw }
    }
}

/// Identity filters alone name the nodes, no need to ask the network.
fn identity_only(filter: &Filter) -> bool {
    filter.classes.is_empty()
        && filter.facts.is_empty()
        && filter.compound.is_empty()
        && !filter.identities.is_empty()
        && filter
            .identities
            .iter()
            .all(|i| !(i.len() > 2 && i.starts_with('/') && i.ends_with('/')))
}

#[async_trait]
impl Discoverer for BroadcastDiscovery {
    async fn discover(
        &self,
        token: &CancellationToken,
        filter: &Filter,
        opts: &DiscoveryOptions,
    ) -> Result<Vec<String>> {
        if identity_only(filter) {
            debug!("performing identity-only filter optimization");
            return Ok(filter.identities.clone());
        }

        let mut msg =
            self.fw
                .new_message("ping", DISCOVERY_AGENT, &opts.collective, RequestType::Broadcast)?;
        msg.set_filter(filter.clone());

        let mut client_opts = ClientOptions::default()
            .receivers(DISCOVERY_RECEIVERS)
            .timeout(opts.timeout);
        if !opts.connection_name.is_empty() {
            client_opts = client_opts.name(format!("{}-discovery", opts.connection_name));
        }
        let client = Client::new(self.fw.clone(), client_opts)?;

        let found = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = Arc::new(Mutex::new(HashSet::<String>::new()));

        let handler = {
            let found = found.clone();
            ReplyMode::handled(move |_, raw| {
                let reply = match Reply::from_transport(&raw.data) {
                    Ok(reply) => reply,
                    Err(e) => {
                        error!(error = %e, "could not process a discovery reply");
                        return;
                    }
                };

                if seen.lock().insert(reply.sender_id().to_string()) {
                    found.lock().push(reply.sender_id().to_string());
                }
            })
        };

        debug!(request_id = %msg.request_id(), collective = %opts.collective, "performing broadcast discovery");

        let dtoken = token.child_token();
        let _guard = dtoken.clone().drop_guard();
        let deadline = {
            let dtoken = dtoken.clone();
            let timeout = opts.timeout;
            tokio::spawn(async move {
                tokio::select! {
                    _ = dtoken.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => dtoken.cancel(),
                }
            })
        };

        let result = client.request(&dtoken, &msg, handler).await;
        dtoken.cancel();
        let _ = deadline.await;

        result.map_err(|e| RpcError::Discovery {
            reason: format!("could not perform request: {}", e),
        })?;

        let nodes = found.lock().clone();
        Ok(nodes)
    }
}

/// Discovers from a fixed inventory.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    nodes: Vec<String>,
}

impl StaticDiscovery {
    /// Creates a discoverer over `nodes`.
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: nodes.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Discoverer for StaticDiscovery {
    async fn discover(
        &self,
        _token: &CancellationToken,
        filter: &Filter,
        _opts: &DiscoveryOptions,
    ) -> Result<Vec<String>> {
        if filter.identities.is_empty() {
            return Ok(self.nodes.clone());
        }

        Ok(self
            .nodes
            .iter()
            .filter(|n| filter.identities.contains(n))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use choria_client::testing::{spawn_fleet, SimulatedNode};
    use choria_client::{ChoriaConfig, MemoryBroker};

    fn framework(broker: &MemoryBroker) -> Arc<Framework> {
        let config = ChoriaConfig {
            identity: "admin.example.net".to_string(),
            ..Default::default()
        };
        Arc::new(Framework::new(config, Arc::new(broker.clone())).unwrap())
    }

    fn options() -> DiscoveryOptions {
        DiscoveryOptions {
            collective: "mcollective".to_string(),
            timeout: Duration::from_millis(200),
            connection_name: "test".to_string(),
        }
    }

    #[test]
    fn test_identity_only() {
        let mut filter = Filter::new();
        assert!(!identity_only(&filter));

        filter.add_identity_filter("n1");
        assert!(identity_only(&filter));

        filter.add_identity_filter("/web/");
        assert!(!identity_only(&filter));

        let mut filter = Filter::new();
        filter.add_identity_filter("n1");
        filter.add_class_filter("apache");
        assert!(!identity_only(&filter));
    }

    #[tokio::test]
    async fn test_broadcast_discovers_matching_nodes() {
        let broker = MemoryBroker::new();
        let token = CancellationToken::new();
        spawn_fleet(
            &broker,
            "mcollective",
            vec![
                SimulatedNode::new("n1", &["package"]),
                SimulatedNode::new("n2", &["package"]),
                SimulatedNode::new("n3", &["service"]),
            ],
            Arc::new(|_, _| None),
            token.clone(),
        )
        .await
        .unwrap();

        let mut filter = Filter::new();
        filter.add_agent_filter("package");

        let discovery = BroadcastDiscovery::new(framework(&broker));
        let mut nodes = discovery.discover(&token, &filter, &options()).await.unwrap();
        nodes.sort();

        assert_eq!(nodes, vec!["n1", "n2"]);
        token.cancel();
    }

    #[tokio::test]
    async fn test_broadcast_identity_filter_skips_network() {
        let broker = MemoryBroker::new();
        let mut filter = Filter::new();
        filter.add_identity_filter("n9");

        let discovery = BroadcastDiscovery::new(framework(&broker));
        let nodes = discovery
            .discover(&CancellationToken::new(), &filter, &options())
            .await
            .unwrap();

        assert_eq!(nodes, vec!["n9"]);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_with_no_nodes() {
        let broker = MemoryBroker::new();
        let discovery = BroadcastDiscovery::new(framework(&broker));
        let nodes = discovery
            .discover(&CancellationToken::new(), &Filter::new(), &options())
            .await
            .unwrap();
        assert!(nodes.is_empty());
    }

    #[tokio::test]
    async fn test_static_discovery() {
        let discovery = StaticDiscovery::new(["n1", "n2", "n3"]);
        let token = CancellationToken::new();

        let all = discovery.discover(&token, &Filter::new(), &options()).await.unwrap();
        assert_eq!(all.len(), 3);

        let mut filter = Filter::new();
        filter.add_identity_filter("n2");
        let some = discovery.discover(&token, &filter, &options()).await.unwrap();
        assert_eq!(some, vec!["n2"]);
    }
}
