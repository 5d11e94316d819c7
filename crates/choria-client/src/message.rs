//! Request and reply envelopes exchanged over the Choria network.
//!
//! The signed wire format is owned by the transport; this module treats it as
//! an opaque JSON document and only exposes the fields the client needs:
//! addressing, reply routing and the request metadata agents act on.

use crate::error::{ClientError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version of version 1 requests.
pub const REQUEST_V1: &str = "choria:request:1";

/// Protocol version of version 1 replies.
pub const REPLY_V1: &str = "choria:reply:1";

/// Default time-to-live of a request in seconds.
pub const DEFAULT_TTL_SECS: u64 = 60;

/// How a request is addressed on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// Broadcast to every node hosting the agent; nodes filter themselves.
    #[serde(rename = "request")]
    Broadcast,
    /// Sent individually to each discovered node.
    #[default]
    #[serde(rename = "direct_request")]
    Direct,
    /// Load balanced to one member of a service agent group.
    #[serde(rename = "service_request")]
    Service,
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestType::Broadcast => write!(f, "request"),
            RequestType::Direct => write!(f, "direct_request"),
            RequestType::Service => write!(f, "service_request"),
        }
    }
}

/// Node selection criteria carried with a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Agents the node must host.
    #[serde(default)]
    pub agents: Vec<String>,
    /// Configuration management classes the node must have.
    #[serde(default)]
    pub classes: Vec<String>,
    /// Fact expressions such as `country=uk`.
    #[serde(default)]
    pub facts: Vec<String>,
    /// Node identities to match.
    #[serde(default)]
    pub identities: Vec<String>,
    /// Compound expression, empty when unused.
    #[serde(default)]
    pub compound: String,
}

impl Filter {
    /// Creates an empty filter matching every node.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when no criteria are set.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
            && self.classes.is_empty()
            && self.facts.is_empty()
            && self.identities.is_empty()
            && self.compound.is_empty()
    }

    /// Adds an agent requirement, ignoring duplicates.
    pub fn add_agent_filter(&mut self, agent: &str) {
        if !self.agents.iter().any(|a| a == agent) {
            self.agents.push(agent.to_string());
        }
    }

    /// Adds an identity requirement, ignoring duplicates.
    pub fn add_identity_filter(&mut self, identity: &str) {
        if !self.identities.iter().any(|i| i == identity) {
            self.identities.push(identity.to_string());
        }
    }

    /// Adds a class requirement, ignoring duplicates.
    pub fn add_class_filter(&mut self, class: &str) {
        if !self.classes.iter().any(|c| c == class) {
            self.classes.push(class.to_string());
        }
    }

    /// Adds a fact requirement, ignoring duplicates.
    pub fn add_fact_filter(&mut self, fact: &str) {
        if !self.facts.iter().any(|f| f == fact) {
            self.facts.push(fact.to_string());
        }
    }
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    request_id: String,
    agent: String,
    collective: String,
    sender_id: String,
    payload: String,
    #[serde(rename = "type")]
    msg_type: RequestType,
    protocol_version: String,
    reply_to: String,
    #[serde(default)]
    discovered_hosts: Vec<String>,
    #[serde(default)]
    filter: Filter,
    ttl: u64,
}

impl Message {
    /// Creates a request whose reply subject defaults to the standard reply target.
    pub fn new(
        payload: impl Into<String>,
        agent: &str,
        collective: &str,
        sender_id: &str,
        request_id: &str,
        msg_type: RequestType,
    ) -> Result<Self> {
        if agent.is_empty() {
            return Err(ClientError::InvalidMessage {
                reason: "agent cannot be empty".to_string(),
            });
        }

        if collective.is_empty() {
            return Err(ClientError::InvalidMessage {
                reason: "collective cannot be empty".to_string(),
            });
        }

        let mut msg = Self {
            request_id: request_id.to_string(),
            agent: agent.to_string(),
            collective: collective.to_string(),
            sender_id: sender_id.to_string(),
            payload: payload.into(),
            msg_type,
            protocol_version: REQUEST_V1.to_string(),
            reply_to: String::new(),
            discovered_hosts: Vec::new(),
            filter: Filter::new(),
            ttl: DEFAULT_TTL_SECS,
        };
        msg.reply_to = msg.reply_target();

        Ok(msg)
    }

    /// Unique id of this request.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Agent the request is for.
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Collective the request is scoped to.
    pub fn collective(&self) -> &str {
        &self.collective
    }

    /// Identity of the publisher.
    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Request body.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Addressing mode.
    pub fn msg_type(&self) -> RequestType {
        self.msg_type
    }

    /// Protocol version.
    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// Subject replies should be published to.
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// Nodes the request is addressed to in direct mode.
    pub fn discovered_hosts(&self) -> &[String] {
        &self.discovered_hosts
    }

    /// Node filter sent with the request.
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Time-to-live in seconds.
    pub fn ttl(&self) -> u64 {
        self.ttl
    }

    /// The reply subject the network would pick for this request.
    pub fn reply_target(&self) -> String {
        reply_subject(&self.collective, &self.sender_id, &self.request_id)
    }

    /// Overrides the reply subject.
    pub fn set_reply_to(&mut self, reply_to: &str) -> Result<()> {
        if reply_to.is_empty() {
            return Err(ClientError::InvalidMessage {
                reason: "reply to cannot be empty".to_string(),
            });
        }

        self.reply_to = reply_to.to_string();
        Ok(())
    }

    /// Moves the request to another collective, keeping a custom reply subject.
    pub fn set_collective(&mut self, collective: &str) -> Result<()> {
        if collective.is_empty() {
            return Err(ClientError::InvalidMessage {
                reason: "collective cannot be empty".to_string(),
            });
        }

        let standard = self.reply_to == self.reply_target();
        self.collective = collective.to_string();
        if standard {
            self.reply_to = self.reply_target();
        }

        Ok(())
    }

    /// Sets the addressing mode.
    pub fn set_type(&mut self, msg_type: RequestType) {
        self.msg_type = msg_type;
    }

    /// Sets the protocol version.
    pub fn set_protocol_version(&mut self, version: &str) {
        self.protocol_version = version.to_string();
    }

    /// Sets the nodes a direct request is sent to.
    pub fn set_discovered_hosts(&mut self, hosts: &[String]) {
        self.discovered_hosts = hosts.to_vec();
    }

    /// Sets the node filter.
    pub fn set_filter(&mut self, filter: Filter) {
        self.filter = filter;
    }

    /// Sets the time-to-live in seconds.
    pub fn set_ttl(&mut self, ttl: u64) {
        self.ttl = ttl;
    }

    /// Subjects this request is published to.
    pub fn publish_subjects(&self) -> Vec<String> {
        match self.msg_type {
            RequestType::Direct => self
                .discovered_hosts
                .iter()
                .map(|host| node_subject(&self.collective, host))
                .collect(),
            RequestType::Broadcast => vec![format!(
                "{}.broadcast.agent.{}",
                self.collective, self.agent
            )],
            RequestType::Service => vec![format!(
                "{}.broadcast.service.{}",
                self.collective, self.agent
            )],
        }
    }

    /// Encodes the request into its transport form.
    pub fn to_transport(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a request from its transport form.
    pub fn from_transport(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// A reply from one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    sender_id: String,
    request_id: String,
    agent: String,
    protocol_version: String,
    message: String,
}

impl Reply {
    /// Creates a reply to `request` from `sender_id`.
    pub fn new(request: &Message, sender_id: &str, message: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            request_id: request.request_id().to_string(),
            agent: request.agent().to_string(),
            protocol_version: REPLY_V1.to_string(),
            message: message.into(),
        }
    }

    /// Identity of the replying node.
    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Request this reply answers.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Agent that produced the reply.
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Reply body.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Encodes the reply into its transport form.
    pub fn to_transport(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a reply from its transport form.
    pub fn from_transport(data: &[u8]) -> Result<Self> {
        let reply: Reply = serde_json::from_slice(data)?;
        if reply.sender_id.is_empty() {
            return Err(ClientError::InvalidMessage {
                reason: "reply has no sender".to_string(),
            });
        }

        Ok(reply)
    }
}

/// A raw message delivered by a subscription.
#[derive(Debug, Clone)]
pub struct ConnectorMessage {
    /// Subject the message was published to.
    pub subject: String,
    /// Reply subject attached by the publisher, if any.
    pub reply: Option<String>,
    /// Raw payload.
    pub data: Bytes,
}

impl ConnectorMessage {
    /// Creates a message without a reply subject.
    pub fn new(subject: &str, data: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.to_string(),
            reply: None,
            data: data.into(),
        }
    }
}

/// Subject a node receives direct requests on.
pub fn node_subject(collective: &str, identity: &str) -> String {
    format!("{}.node.{}", collective, identity)
}

/// Subject replies for a request are published to.
pub fn reply_subject(collective: &str, identity: &str, request_id: &str) -> String {
    format!("{}.reply.{}.{}", collective, identity, request_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_message(msg_type: RequestType) -> Message {
        Message::new(
            r#"{"agent":"package"}"#,
            "package",
            "mcollective",
            "admin.example.net",
            "abc123",
            msg_type,
        )
        .unwrap()
    }

    #[test]
    fn test_new_sets_standard_reply_to() {
        let msg = make_message(RequestType::Direct);
        assert_eq!(msg.reply_to(), "mcollective.reply.admin.example.net.abc123");
        assert_eq!(msg.reply_to(), msg.reply_target());
        assert_eq!(msg.protocol_version(), REQUEST_V1);
        assert_eq!(msg.ttl(), DEFAULT_TTL_SECS);
    }

    #[test]
    fn test_new_rejects_empty_agent() {
        let result = Message::new("{}", "", "mcollective", "me", "1", RequestType::Direct);
        assert!(result.is_err());
    }

    #[test]
    fn test_set_collective_moves_standard_reply_to() {
        let mut msg = make_message(RequestType::Direct);
        msg.set_collective("eu").unwrap();
        assert_eq!(msg.reply_to(), "eu.reply.admin.example.net.abc123");
    }

    #[test]
    fn test_set_collective_keeps_custom_reply_to() {
        let mut msg = make_message(RequestType::Direct);
        msg.set_reply_to("custom.reply.to").unwrap();
        msg.set_collective("eu").unwrap();
        assert_eq!(msg.reply_to(), "custom.reply.to");
    }

    #[test]
    fn test_set_reply_to_rejects_empty() {
        let mut msg = make_message(RequestType::Direct);
        assert!(msg.set_reply_to("").is_err());
    }

    #[test]
    fn test_publish_subjects_direct() {
        let mut msg = make_message(RequestType::Direct);
        msg.set_discovered_hosts(&["n1".to_string(), "n2".to_string()]);
        assert_eq!(
            msg.publish_subjects(),
            vec!["mcollective.node.n1".to_string(), "mcollective.node.n2".to_string()]
        );
    }

    #[test]
    fn test_publish_subjects_broadcast_and_service() {
        let msg = make_message(RequestType::Broadcast);
        assert_eq!(msg.publish_subjects(), vec!["mcollective.broadcast.agent.package"]);

        let msg = make_message(RequestType::Service);
        assert_eq!(msg.publish_subjects(), vec!["mcollective.broadcast.service.package"]);
    }

    #[test]
    fn test_transport_preserves_request() {
        let mut msg = make_message(RequestType::Direct);
        msg.set_discovered_hosts(&["n1".to_string()]);
        let mut filter = Filter::new();
        filter.add_agent_filter("package");
        msg.set_filter(filter);

        let decoded = Message::from_transport(&msg.to_transport().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_reply_from_transport_requires_sender() {
        let msg = make_message(RequestType::Direct);
        let reply = Reply::new(&msg, "", "{}");
        let data = reply.to_transport().unwrap();
        assert!(Reply::from_transport(&data).is_err());

        assert!(Reply::from_transport(b"not json").is_err());
    }

    #[test]
    fn test_filter_dedupes() {
        let mut filter = Filter::new();
        assert!(filter.is_empty());
        filter.add_agent_filter("package");
        filter.add_agent_filter("package");
        filter.add_identity_filter("n1");
        assert_eq!(filter.agents.len(), 1);
        assert_eq!(filter.identities.len(), 1);
        assert!(!filter.is_empty());
    }

    #[test]
    fn test_request_type_display() {
        assert_eq!(RequestType::Broadcast.to_string(), "request");
        assert_eq!(RequestType::Direct.to_string(), "direct_request");
        assert_eq!(RequestType::Service.to_string(), "service_request");
    }
}
