//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use choria_client::testing::{spawn_fleet, ReplyFn, SimulatedNode};
use choria_client::{ChoriaConfig, ConnectorMessage, Framework, MemoryBroker, Message, Reply, ReplyMode};
use choria_rpc::{RequestClient, RpcReply, StatusCode};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub const COLLECTIVE: &str = "mcollective";

/// Installs a test subscriber honouring `RUST_LOG`, once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn framework(broker: &MemoryBroker) -> Arc<Framework> {
    let config = ChoriaConfig {
        identity: "admin.example.net".to_string(),
        collectives: vec![COLLECTIVE.to_string(), "eu".to_string()],
        discovery_timeout_secs: 1,
        ..Default::default()
    };
    Arc::new(Framework::new(config, Arc::new(broker.clone())).unwrap())
}

pub fn ok_body() -> String {
    RpcReply::new(StatusCode::Ok, "OK", serde_json::json!({"status": "running"}))
        .to_json()
        .unwrap()
}

pub fn error_body() -> String {
    RpcReply::new(StatusCode::UnknownError, "failed", serde_json::Value::Null)
        .to_json()
        .unwrap()
}

/// Every node answers OK.
pub fn always_ok() -> ReplyFn {
    Arc::new(|_, _| Some(ok_body()))
}

pub fn names(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}{}", prefix, i)).collect()
}

/// An in-memory fleet of nodes hosting `agent`.
pub struct TestFleet {
    pub broker: MemoryBroker,
    pub fw: Arc<Framework>,
    pub token: CancellationToken,
}

impl TestFleet {
    pub async fn start(nodes: Vec<SimulatedNode>, reply: ReplyFn) -> Self {
        init_tracing();

        let broker = MemoryBroker::new();
        let token = CancellationToken::new();
        spawn_fleet(&broker, COLLECTIVE, nodes, reply, token.clone())
            .await
            .unwrap();

        Self {
            fw: framework(&broker),
            broker,
            token,
        }
    }

    pub async fn with_agent(agent: &str, identities: &[String]) -> Self {
        let nodes = identities
            .iter()
            .map(|id| SimulatedNode::new(id, &[agent]))
            .collect();
        Self::start(nodes, always_ok()).await
    }

    /// Requests published for `agent`, in order.
    pub fn published_for(&self, agent: &str) -> Vec<Message> {
        self.broker
            .published()
            .into_iter()
            .filter(|m| m.agent() == agent)
            .collect()
    }
}

impl Drop for TestFleet {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Request client that answers OK on behalf of every addressed node and
/// records what it was asked to do.
#[derive(Default)]
pub struct RecordingClient {
    calls: Mutex<Vec<(Instant, Vec<String>)>>,
    cancel_after_first: Option<CancellationToken>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels `token` once the first request completed.
    pub fn cancelling(token: CancellationToken) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            cancel_after_first: Some(token),
        }
    }

    pub fn calls(&self) -> Vec<(Instant, Vec<String>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl RequestClient for RecordingClient {
    async fn request(
        &self,
        token: &CancellationToken,
        msg: &Message,
        mode: ReplyMode,
    ) -> choria_client::Result<()> {
        self.calls
            .lock()
            .push((Instant::now(), msg.discovered_hosts().to_vec()));

        if let ReplyMode::Handled(handler) = mode {
            for host in msg.discovered_hosts() {
                let data = Reply::new(msg, host, ok_body()).to_transport()?;
                handler(token, ConnectorMessage::new(msg.reply_to(), data));
            }
        }

        if let Some(cancel) = &self.cancel_after_first {
            cancel.cancel();
        }

        Ok(())
    }
}
