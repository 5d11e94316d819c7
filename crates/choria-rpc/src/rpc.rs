//! The RPC orchestrator.
//!
//! [`Rpc::do_request`] runs one action against a fleet: discovery when no
//! targets are given, message setup, then sequential batches each driven by
//! a [`Client`]. Every batch has its own [`Stats`] that is folded into the
//! request total once the batch completes; a batch ends early as soon as
//! every node in it replied.

use crate::batch::{in_groups, interruptible_sleep};
use crate::discovery::{BroadcastDiscovery, Discoverer, DiscoveryOptions, BROADCAST_METHOD};
use crate::error::{Result, RpcError};
use crate::nodelist::NodeList;
use crate::options::{RequestOptions, RequestOptionsBuilder};
use crate::reply::parse_reply;
use crate::stats::Stats;
use async_trait::async_trait;
use choria_client::{Client, ClientOptions, Framework, Message, Reply, ReplyMode, RequestType};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Publishes a message and feeds replies to a handler.
///
/// [`Client`] is the network implementation; tests and embedders can supply
/// their own through [`Rpc::with_client`].
#[async_trait]
pub trait RequestClient: Send + Sync {
    /// Performs one request, see [`Client::request`].
    async fn request(
        &self,
        token: &CancellationToken,
        msg: &Message,
        mode: ReplyMode,
    ) -> choria_client::Result<()>;
}

#[async_trait]
impl RequestClient for Client {
    async fn request(
        &self,
        token: &CancellationToken,
        msg: &Message,
        mode: ReplyMode,
    ) -> choria_client::Result<()> {
        Client::request(self, token, msg, mode).await
    }
}

/// What the orchestrator needs to know about an agent.
#[derive(Debug, Clone)]
pub struct AgentMetadata {
    /// Agent name.
    pub name: String,
    /// How long the agent's actions may run.
    pub timeout: Duration,
    /// Service agents are load balanced over a group of nodes.
    pub service: bool,
}

impl AgentMetadata {
    /// Metadata for a regular agent.
    pub fn new(name: &str, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            timeout,
            service: false,
        }
    }

    /// Marks the agent as a service agent.
    pub fn service(mut self) -> Self {
        self.service = true;
        self
    }
}

/// Outcome of a request.
#[derive(Debug, Clone)]
pub struct RequestResult {
    stats: Arc<Stats>,
}

impl RequestResult {
    /// Statistics for the whole request.
    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }
}

/// Client for one agent. Requests on the same instance run one at a time.
pub struct Rpc {
    fw: Arc<Framework>,
    agent: AgentMetadata,
    discoverers: HashMap<String, Arc<dyn Discoverer>>,
    client: Option<Arc<dyn RequestClient>>,
    lock: Mutex<()>,
}

impl Rpc {
    /// Creates an orchestrator for `agent` with broadcast discovery registered.
    pub fn new(fw: Arc<Framework>, agent: AgentMetadata) -> Result<Self> {
        if agent.name.is_empty() {
            return Err(RpcError::Config {
                msg: "agent name cannot be empty".to_string(),
            });
        }

        let mut discoverers: HashMap<String, Arc<dyn Discoverer>> = HashMap::new();
        discoverers.insert(
            BROADCAST_METHOD.to_string(),
            Arc::new(BroadcastDiscovery::new(fw.clone())),
        );

        Ok(Self {
            fw,
            agent,
            discoverers,
            client: None,
            lock: Mutex::new(()),
        })
    }

    /// Registers a discovery method under `name`.
    pub fn with_discoverer(mut self, name: &str, discoverer: Arc<dyn Discoverer>) -> Self {
        self.discoverers.insert(name.to_string(), discoverer);
        self
    }

    /// Uses `client` for every batch instead of building network clients.
    pub fn with_client(mut self, client: Arc<dyn RequestClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// The agent this orchestrator talks to.
    pub fn agent(&self) -> &AgentMetadata {
        &self.agent
    }

    /// Performs `action` with `payload` and returns the request statistics.
    ///
    /// Discovery runs first unless targets are given or this is a service
    /// request. Nodes that never answer show up in
    /// [`Stats::no_response_from`]; they are not an error.
    pub async fn do_request<P>(
        &self,
        token: &CancellationToken,
        action: &str,
        payload: &P,
        builder: RequestOptionsBuilder,
    ) -> Result<RequestResult>
    where
        P: Serialize + Sync + ?Sized,
    {
        let _lock = self.lock.lock().await;

        let mut opts = builder.build(&self.fw, self.agent.timeout)?;
        if self.agent.service {
            opts.request_type = RequestType::Service;
            opts.workers = 1;
        }
        let service = opts.request_type == RequestType::Service;
        let total = opts.stats();

        let token = token.child_token();
        let _guard = token.clone().drop_guard();

        if opts.progress {
            total.start_progress(token.clone());
        }

        if opts.targets.is_empty() && !service {
            self.discover(&token, &mut opts).await?;
        }

        opts.dedup_targets();
        let discovered = opts.targets.len();
        let mut msg = self.setup_message(action, payload, &mut opts)?;

        if let Some(cb) = &opts.discovery_end {
            cb(discovered, opts.targets.len())?;
        }

        total.start();
        total.set_action(action);
        total.set_agent(&self.agent.name);

        let result = if service {
            self.service_request(&token, &opts, &msg).await
        } else {
            self.batched_request(&token, &opts, &mut msg).await
        };

        total.end();
        result?;

        debug!(
            request_id = %opts.request_id,
            ok = total.ok_count(),
            failed = total.fail_count(),
            missing = total.no_response_from().len(),
            "request completed"
        );

        Ok(RequestResult { stats: total })
    }

    async fn discover(&self, token: &CancellationToken, opts: &mut RequestOptions) -> Result<()> {
        if let Some(cb) = &opts.discovery_start {
            cb();
        }

        let discoverer = self
            .discoverers
            .get(&opts.discovery_method)
            .cloned()
            .ok_or_else(|| RpcError::UnknownDiscoveryMethod {
                method: opts.discovery_method.clone(),
            })?;

        opts.filter.add_agent_filter(&self.agent.name);

        let dopts = DiscoveryOptions {
            collective: opts.collective.clone(),
            timeout: opts.discovery_timeout,
            connection_name: opts.connection_name.clone(),
        };

        let total = opts.stats();
        total.start_discover();
        let nodes = discoverer.discover(token, &opts.filter, &dopts).await;
        total.end_discover();

        let nodes = nodes.map_err(|e| match e {
            RpcError::Discovery { .. } => e,
            other => RpcError::Discovery {
                reason: other.to_string(),
            },
        })?;

        if nodes.is_empty() {
            return Err(RpcError::NoTargets);
        }

        info!(agent = %self.agent.name, method = %opts.discovery_method, nodes = nodes.len(), "discovered nodes");
        opts.targets = nodes;

        Ok(())
    }

    fn setup_message<P>(
        &self,
        action: &str,
        payload: &P,
        opts: &mut RequestOptions,
    ) -> Result<Message>
    where
        P: Serialize + ?Sized,
    {
        let body = serde_json::to_string(&serde_json::json!({
            "agent": self.agent.name,
            "action": action,
            "data": serde_json::to_value(payload)?,
        }))?;

        let mut msg = self.fw.new_message(
            body,
            &self.agent.name,
            &self.fw.config().main_collective,
            RequestType::Direct,
        )?;
        opts.configure_message(&mut msg)?;

        Ok(msg)
    }

    async fn batched_request(
        &self,
        token: &CancellationToken,
        opts: &RequestOptions,
        msg: &mut Message,
    ) -> Result<()> {
        let total = opts.stats();
        let groups = in_groups(&opts.targets, opts.batch_size);
        let batches = groups.len();

        for (ctr, nodes) in groups.into_iter().enumerate() {
            if ctr > 0 && !interruptible_sleep(token, opts.batch_sleep).await {
                debug!(request_id = %opts.request_id, batch = ctr, "request cancelled between batches");
                break;
            }

            let stats = Arc::new(Stats::new());
            stats.set_request_id(&opts.request_id);
            stats.set_discovered_nodes(&nodes);
            msg.set_discovered_hosts(&nodes);

            debug!(
                request_id = %opts.request_id,
                batch = ctr,
                batches,
                nodes = nodes.len(),
                targets = opts.targets.len(),
                "performing batched request"
            );

            stats.start();
            let batch_token = token.child_token();
            let result = self.request(&batch_token, opts, msg, &stats, None).await;
            batch_token.cancel();
            stats.end();

            if let Err(e) = total.merge(&stats) {
                debug!(request_id = %opts.request_id, batch = ctr, error = %e, "batch merged without publish time");
            }

            result?;
        }

        Ok(())
    }

    async fn service_request(
        &self,
        token: &CancellationToken,
        opts: &RequestOptions,
        msg: &Message,
    ) -> Result<()> {
        let total = opts.stats();
        let stats = Arc::new(Stats::new());
        stats.set_request_id(&opts.request_id);
        let responders = Arc::new(NodeList::new());

        stats.start();
        let svc_token = token.child_token();
        let result = self
            .request(&svc_token, opts, msg, &stats, Some(responders.clone()))
            .await;
        svc_token.cancel();
        stats.end();

        let who = responders.hosts();
        debug!(request_id = %opts.request_id, responders = ?who, "service request completed");

        stats.set_discovered_nodes(&who);
        for node in &who {
            stats.record_received(node);
        }
        total.set_discovered_nodes(&who);

        if let Err(e) = total.merge(&stats) {
            debug!(request_id = %opts.request_id, error = %e, "service request merged without publish time");
        }

        result
    }

    async fn request(
        &self,
        token: &CancellationToken,
        opts: &RequestOptions,
        msg: &Message,
        stats: &Arc<Stats>,
        responders: Option<Arc<NodeList>>,
    ) -> Result<()> {
        let client = self.client_for(token, opts, stats).await?;
        let mode = reply_mode(opts, stats.clone(), responders);

        client.request(token, msg, mode).await?;

        Ok(())
    }

    async fn client_for(
        &self,
        token: &CancellationToken,
        opts: &RequestOptions,
        stats: &Arc<Stats>,
    ) -> Result<Arc<dyn RequestClient>> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }

        let starting = stats.clone();
        let finished = stats.clone();
        let mut client_opts = ClientOptions::default()
            .receivers(opts.workers)
            .timeout(opts.timeout)
            .name(opts.connection_name.clone())
            .on_publish_start(Arc::new(move || starting.start_publish()))
            .on_publish_finish(Arc::new(move || finished.end_publish()));

        if opts.batched() {
            let name = format!("{}_{}_batched", opts.connection_name, opts.request_id);
            let conn = self.fw.new_connector(token, &name).await?;
            client_opts = client_opts.connection(conn);
        }

        Ok(Arc::new(Client::new(self.fw.clone(), client_opts)?))
    }
}

impl std::fmt::Debug for Rpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<&String> = self.discoverers.keys().collect();
        methods.sort();
        f.debug_struct("Rpc")
            .field("agent", &self.agent)
            .field("discovery_methods", &methods)
            .finish()
    }
}

/// Builds the per-batch reply handler.
///
/// Raw replies go straight to the caller's channel when one is set.
///
/// Each reply is decoded, its sender recorded and its status classified
/// before the caller's handler sees it. With `responders` set, senders are
/// collected there instead of being recorded, so the first reply completes
/// the request.
fn reply_mode(
    opts: &RequestOptions,
    stats: Arc<Stats>,
    responders: Option<Arc<NodeList>>,
) -> ReplyMode {
    if !opts.process_replies {
        return match opts.replies.clone() {
            Some(replies) => ReplyMode::handled(move |_, raw| {
                if let Err(e) = replies.try_send(raw) {
                    debug!(error = %e, "dropping raw reply");
                }
            }),
            None => ReplyMode::NoReplyExpected,
        };
    }

    let handler = opts.handler.clone();
    let action = opts.stats().action();

    ReplyMode::handled(move |token, raw| {
        let reply = match Reply::from_transport(&raw.data) {
            Ok(reply) => reply,
            Err(e) => {
                stats.failed_request_inc();
                error!(error = %e, "could not process a reply");
                return;
            }
        };

        match &responders {
            Some(responders) => responders.add([reply.sender_id()]),
            None => stats.record_received(reply.sender_id()),
        }

        match parse_reply(&reply, &action) {
            Ok(rpc_reply) => {
                if rpc_reply.is_ok() {
                    stats.passed_request_inc();
                } else {
                    stats.failed_request_inc();
                }

                if let Some(handler) = &handler {
                    handler(&reply, &rpc_reply);
                }
            }
            Err(e) => {
                stats.failed_request_inc();
                error!(sender = %reply.sender_id(), error = %e, "could not process reply");
            }
        }

        if stats.all() {
            token.cancel();
        }
    })
}
