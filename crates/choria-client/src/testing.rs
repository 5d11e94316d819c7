//! Simulated fleet for exercising clients against a [`MemoryBroker`].
//!
//! Each simulated node listens on its direct subject, on the broadcast
//! subject of every agent it hosts (plus `discovery`), and in the queue group
//! of every hosted service agent. Discovery pings are answered automatically;
//! everything else is answered by a caller supplied function.

use crate::connector::Connector;
use crate::error::Result;
use crate::memory::MemoryBroker;
use crate::message::{node_subject, Filter, Message, Reply, RequestType};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Agent every node answers discovery pings with.
pub const DISCOVERY_AGENT: &str = "discovery";

/// Builds the reply body for a request, `None` to stay silent.
pub type ReplyFn = Arc<dyn Fn(&Message, &str) -> Option<String> + Send + Sync>;

/// One simulated node.
#[derive(Debug, Clone)]
pub struct SimulatedNode {
    /// Node identity.
    pub identity: String,
    /// Agents the node hosts.
    pub agents: Vec<String>,
    /// Service agents the node is a member of.
    pub services: Vec<String>,
    /// Delay before replying.
    pub delay: Duration,
}

impl SimulatedNode {
    /// Creates a node hosting `agents` that replies immediately.
    pub fn new(identity: &str, agents: &[&str]) -> Self {
        Self {
            identity: identity.to_string(),
            agents: agents.iter().map(|a| a.to_string()).collect(),
            services: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    /// Adds a service agent membership.
    pub fn with_service(mut self, agent: &str) -> Self {
        self.services.push(agent.to_string());
        self
    }

    /// Sets the reply delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Returns true when `filter` selects this node.
    pub fn matches(&self, filter: &Filter) -> bool {
        let agents_ok = filter
            .agents
            .iter()
            .all(|a| self.agents.contains(a) || self.services.contains(a));
        let identity_ok =
            filter.identities.is_empty() || filter.identities.contains(&self.identity);

        agents_ok && identity_ok && filter.classes.is_empty() && filter.facts.is_empty()
    }
}

/// Connects every node to `broker` and answers requests until `token` is
/// cancelled. Subscriptions are live when this returns.
pub async fn spawn_fleet(
    broker: &MemoryBroker,
    collective: &str,
    nodes: Vec<SimulatedNode>,
    reply: ReplyFn,
    token: CancellationToken,
) -> Result<()> {
    for node in nodes {
        let conn = broker.connection(&format!("node-{}", node.identity));
        let (tx, rx) = mpsc::channel(1024);

        conn.queue_subscribe(
            token.clone(),
            &node.identity,
            &node_subject(collective, &node.identity),
            "",
            tx.clone(),
        )
        .await?;

        let mut broadcast = node.agents.clone();
        broadcast.push(DISCOVERY_AGENT.to_string());
        for agent in &broadcast {
            let subject = format!("{}.broadcast.agent.{}", collective, agent);
            conn.queue_subscribe(token.clone(), &node.identity, &subject, "", tx.clone())
                .await?;
        }

        for agent in &node.services {
            let subject = format!("{}.broadcast.service.{}", collective, agent);
            conn.queue_subscribe(token.clone(), &node.identity, &subject, agent, tx.clone())
                .await?;
        }

        tokio::spawn(run_node(broker.clone(), node, rx, reply.clone(), token.clone()));
    }

    Ok(())
}

async fn run_node(
    broker: MemoryBroker,
    node: SimulatedNode,
    mut rx: mpsc::Receiver<crate::message::ConnectorMessage>,
    reply: ReplyFn,
    token: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            _ = token.cancelled() => break,
            raw = rx.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };

        let msg = match Message::from_transport(&raw.data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(node = %node.identity, error = %e, "ignoring undecodable request");
                continue;
            }
        };

        if msg.msg_type() == RequestType::Broadcast && !node.matches(msg.filter()) {
            trace!(node = %node.identity, request_id = %msg.request_id(), "filter did not match");
            continue;
        }

        let body = if msg.agent() == DISCOVERY_AGENT {
            Some("pong".to_string())
        } else {
            reply(&msg, &node.identity)
        };

        let Some(body) = body else { continue };

        if !node.delay.is_zero() {
            tokio::time::sleep(node.delay).await;
        }

        match Reply::new(&msg, &node.identity, body).to_transport() {
            Ok(data) => {
                broker.publish_raw(msg.reply_to(), data);
            }
            Err(e) => debug!(node = %node.identity, error = %e, "could not encode reply"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_agent_and_identity() {
        let node = SimulatedNode::new("n1", &["package"]);

        let mut filter = Filter::new();
        assert!(node.matches(&filter));

        filter.add_agent_filter("package");
        assert!(node.matches(&filter));

        filter.add_identity_filter("n2");
        assert!(!node.matches(&filter));

        let mut filter = Filter::new();
        filter.add_agent_filter("service");
        assert!(!node.matches(&filter));

        let mut filter = Filter::new();
        filter.add_class_filter("apache");
        assert!(!node.matches(&filter));
    }

    #[tokio::test]
    async fn test_fleet_answers_direct_requests() {
        let broker = MemoryBroker::new();
        let token = CancellationToken::new();
        spawn_fleet(
            &broker,
            "mcollective",
            vec![SimulatedNode::new("n1", &["package"])],
            Arc::new(|msg, identity| Some(format!("{}:{}", identity, msg.agent()))),
            token.clone(),
        )
        .await
        .unwrap();

        let mut msg =
            Message::new("{}", "package", "mcollective", "me", "r1", RequestType::Direct).unwrap();
        msg.set_discovered_hosts(&["n1".to_string()]);

        let conn = broker.connection("client");
        let (tx, mut rx) = mpsc::channel(10);
        conn.queue_subscribe(token.clone(), "replies", msg.reply_to(), "", tx)
            .await
            .unwrap();
        conn.publish(&msg).await.unwrap();

        let raw = rx.recv().await.unwrap();
        let reply = Reply::from_transport(&raw.data).unwrap();
        assert_eq!(reply.sender_id(), "n1");
        assert_eq!(reply.message(), "n1:package");
        token.cancel();
    }
}
