//! Per-request options.
//!
//! Callers describe a request with a [`RequestOptionsBuilder`]; the
//! orchestrator resolves it against the configuration into a
//! [`RequestOptions`] and finalises the derived fields once, in
//! [`RequestOptions::configure_message`], before anything is published.

use crate::error::{Result, RpcError};
use crate::limit::{limit_targets, LimitMethod};
use crate::reply::RpcReply;
use crate::stats::Stats;
use choria_client::message::REQUEST_V1;
use choria_client::{ConnectorMessage, Filter, Framework, Message, Reply, RequestType};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Called for every reply that decoded successfully.
pub type ReplyHandler = Arc<dyn Fn(&Reply, &RpcReply) + Send + Sync>;

/// Called before discovery starts.
pub type DiscoveryStartFn = Arc<dyn Fn() + Send + Sync>;

/// Called after discovery with the discovered and the limited target
/// counts. An error aborts the request.
pub type DiscoveryEndFn = Arc<dyn Fn(usize, usize) -> Result<()> + Send + Sync>;

/// Default number of reply receivers.
pub const DEFAULT_WORKERS: usize = 3;

/// Resolved options for one request.
#[derive(Clone)]
pub struct RequestOptions {
    /// Nodes to address; empty triggers discovery.
    pub targets: Vec<String>,
    /// Nodes per batch, 0 for a single batch.
    pub batch_size: usize,
    /// Pause between batches.
    pub batch_sleep: Duration,
    /// Protocol version of the request.
    pub protocol_version: String,
    /// Addressing mode.
    pub request_type: RequestType,
    /// Collective to publish into.
    pub collective: String,
    /// Number of reply receivers.
    pub workers: usize,
    /// Reply subject, empty for the standard one.
    pub reply_to: String,
    /// Whether replies are received and classified.
    pub process_replies: bool,
    /// Idle timeout while waiting for replies.
    pub timeout: Duration,
    /// Discovery timeout.
    pub discovery_timeout: Duration,
    /// Name of the discoverer used when no targets are given.
    pub discovery_method: String,
    /// Node filter.
    pub filter: Filter,
    /// Caller reply handler.
    pub handler: Option<ReplyHandler>,
    /// Receives raw replies instead of them being processed.
    pub replies: Option<mpsc::Sender<ConnectorMessage>>,
    /// Base name of connections opened for the request.
    pub connection_name: String,
    /// Request id, set when the message is configured.
    pub request_id: String,
    /// Target limiting method.
    pub limit_method: LimitMethod,
    /// Target limit, a count or a percentage; empty for no limit.
    pub limit_size: String,
    /// Seed for random limiting.
    pub limit_seed: i64,
    /// Log periodic progress while the request runs.
    pub progress: bool,
    /// Discovery start callback.
    pub discovery_start: Option<DiscoveryStartFn>,
    /// Discovery end callback.
    pub discovery_end: Option<DiscoveryEndFn>,
    total_stats: Arc<Stats>,
}

impl RequestOptions {
    /// Starts building options.
    pub fn builder() -> RequestOptionsBuilder {
        RequestOptionsBuilder::default()
    }

    /// Statistics covering the whole request.
    pub fn stats(&self) -> Arc<Stats> {
        self.total_stats.clone()
    }

    /// Applies these options to `msg` and settles the derived fields:
    /// target limits, batch size, reply handling and collective.
    pub fn configure_message(&mut self, msg: &mut Message) -> Result<()> {
        self.request_id = msg.request_id().to_string();
        self.total_stats.set_request_id(msg.request_id());

        if self.request_type == RequestType::Service {
            if !self.targets.is_empty() {
                return Err(RpcError::Config {
                    msg: "service requests do not support custom targets".to_string(),
                });
            }

            if !self.filter.is_empty() {
                return Err(RpcError::Config {
                    msg: "service requests do not support filters".to_string(),
                });
            }
        } else {
            self.dedup_targets();
            self.targets = limit_targets(
                &self.targets,
                self.limit_method,
                &self.limit_size,
                self.limit_seed,
            )?;
        }

        msg.set_filter(self.filter.clone());
        msg.set_discovered_hosts(&self.targets);
        self.total_stats.set_discovered_nodes(&self.targets);

        msg.set_protocol_version(&self.protocol_version);

        if self.request_type == RequestType::Broadcast && self.batch_size > 0 {
            return Err(RpcError::Config {
                msg: "batched mode requires direct_request mode".to_string(),
            });
        }

        msg.set_type(self.request_type);

        if self.batch_size == 0 {
            self.batch_size = self.targets.len();
        }

        let standard = msg.reply_target();
        if self.reply_to.is_empty() {
            self.reply_to = standard.clone();
        }

        // nobody here listens on a custom reply subject
        if self.reply_to != standard {
            self.process_replies = false;
        }

        msg.set_reply_to(&self.reply_to)?;
        msg.set_collective(&self.collective)?;

        if self.reply_to == standard {
            self.reply_to = msg.reply_to().to_string();
        }

        Ok(())
    }

    /// Drops repeated targets, keeping the first occurrence of each.
    pub fn dedup_targets(&mut self) {
        let mut seen = HashSet::with_capacity(self.targets.len());
        self.targets.retain(|t| seen.insert(t.clone()));
    }

    /// Returns true when each batch needs its own connection.
    pub fn batched(&self) -> bool {
        self.process_replies && self.batch_size != self.targets.len()
    }
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("request_id", &self.request_id)
            .field("targets", &self.targets.len())
            .field("batch_size", &self.batch_size)
            .field("request_type", &self.request_type)
            .field("collective", &self.collective)
            .field("workers", &self.workers)
            .field("process_replies", &self.process_replies)
            .field("raw_replies", &self.replies.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Builder for [`RequestOptions`]. Anything left unset falls back to the
/// configuration or to the agent's defaults.
#[derive(Clone, Default)]
pub struct RequestOptionsBuilder {
    targets: Vec<String>,
    batch: Option<(usize, Duration)>,
    protocol_version: Option<String>,
    request_type: Option<RequestType>,
    collective: Option<String>,
    workers: Option<usize>,
    reply_to: Option<String>,
    timeout: Option<Duration>,
    discovery_timeout: Option<Duration>,
    discovery_method: Option<String>,
    filter: Option<Filter>,
    handler: Option<ReplyHandler>,
    replies: Option<mpsc::Sender<ConnectorMessage>>,
    connection_name: Option<String>,
    limit_method: Option<LimitMethod>,
    limit_size: Option<String>,
    limit_seed: Option<i64>,
    progress: bool,
    discovery_start: Option<DiscoveryStartFn>,
    discovery_end: Option<DiscoveryEndFn>,
}

impl RequestOptionsBuilder {
    /// Addresses these nodes instead of discovering.
    pub fn targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    /// Sends to `size` nodes at a time, pausing `sleep` in between. Batched
    /// requests use a single receiver unless [`Self::workers`] says otherwise.
    pub fn in_batches(mut self, size: usize, sleep: Duration) -> Self {
        self.batch = Some((size, sleep));
        self
    }

    /// Sets the protocol version.
    pub fn protocol(mut self, version: &str) -> Self {
        self.protocol_version = Some(version.to_string());
        self
    }

    /// Broadcasts the request and lets nodes filter themselves.
    pub fn broadcast(mut self) -> Self {
        self.request_type = Some(RequestType::Broadcast);
        self
    }

    /// Sends the request to each target individually.
    pub fn direct(mut self) -> Self {
        self.request_type = Some(RequestType::Direct);
        self
    }

    /// Sends the request to one member of a service agent group.
    pub fn service_request(mut self) -> Self {
        self.request_type = Some(RequestType::Service);
        self
    }

    /// Sets the number of reply receivers.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Targets another collective.
    pub fn collective(mut self, collective: &str) -> Self {
        self.collective = Some(collective.to_string());
        self
    }

    /// Sends replies elsewhere. Replies are then not processed here.
    pub fn reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_string());
        self
    }

    /// Sets the idle timeout while waiting for replies.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the discovery timeout.
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = Some(timeout);
        self
    }

    /// Picks a registered discovery method by name.
    pub fn discovery_method(mut self, method: &str) -> Self {
        self.discovery_method = Some(method.to_string());
        self
    }

    /// Restricts discovery with a filter.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Calls `handler` with every decoded reply.
    pub fn reply_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Reply, &RpcReply) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Delivers raw replies to `replies`. Replies are then not decoded or
    /// counted, and the request runs until the timeout.
    pub fn replies(mut self, replies: mpsc::Sender<ConnectorMessage>) -> Self {
        self.replies = Some(replies);
        self
    }

    /// Sets the base connection name.
    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_string());
        self
    }

    /// Sets the target limiting method.
    pub fn limit_method(mut self, method: LimitMethod) -> Self {
        self.limit_method = Some(method);
        self
    }

    /// Limits the request to a count (`10`) or percentage (`25%`) of the targets.
    pub fn limit_size(mut self, size: &str) -> Self {
        self.limit_size = Some(size.to_string());
        self
    }

    /// Seeds random target limiting.
    pub fn limit_seed(mut self, seed: i64) -> Self {
        self.limit_seed = Some(seed);
        self
    }

    /// Logs progress every second while the request runs.
    pub fn progress(mut self) -> Self {
        self.progress = true;
        self
    }

    /// Calls `cb` before discovery starts.
    pub fn on_discovery_start<F>(mut self, cb: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.discovery_start = Some(Arc::new(cb));
        self
    }

    /// Calls `cb` once targets are known; returning an error aborts.
    pub fn on_discovery_end<F>(mut self, cb: F) -> Self
    where
        F: Fn(usize, usize) -> Result<()> + Send + Sync + 'static,
    {
        self.discovery_end = Some(Arc::new(cb));
        self
    }

    /// Resolves the options against `fw`'s configuration. `agent_timeout`
    /// is how long the agent's actions may run.
    pub fn build(self, fw: &Framework, agent_timeout: Duration) -> Result<RequestOptions> {
        let config = fw.config();

        let collective = self
            .collective
            .unwrap_or_else(|| config.main_collective.clone());
        fw.check_collective(&collective)?;

        let limit_method = match self.limit_method {
            Some(method) => method,
            None => config.rpc_limit_method.parse()?,
        };

        let discovery_timeout = self
            .discovery_timeout
            .unwrap_or_else(|| config.discovery_timeout());

        let (batch_size, batch_sleep) = self.batch.unwrap_or((0, Duration::ZERO));
        let default_workers = if self.batch.is_some() { 1 } else { DEFAULT_WORKERS };
        let workers = self.workers.unwrap_or(default_workers);
        if workers == 0 {
            return Err(RpcError::Config {
                msg: "at least one worker is required".to_string(),
            });
        }

        let reply_to = self.reply_to.unwrap_or_default();
        let process_replies = reply_to.is_empty() && self.replies.is_none();

        let connection_name = self.connection_name.unwrap_or_else(|| {
            format!("{}-mcorpc-{}", fw.identity(), fw.new_request_id())
        });

        Ok(RequestOptions {
            targets: self.targets,
            batch_size,
            batch_sleep,
            protocol_version: self
                .protocol_version
                .unwrap_or_else(|| REQUEST_V1.to_string()),
            request_type: self.request_type.unwrap_or_default(),
            collective,
            workers,
            reply_to,
            process_replies,
            timeout: self.timeout.unwrap_or(discovery_timeout + agent_timeout),
            discovery_timeout,
            discovery_method: self
                .discovery_method
                .unwrap_or_else(|| config.default_discovery_method.clone()),
            filter: self.filter.unwrap_or_default(),
            handler: self.handler,
            replies: self.replies,
            connection_name,
            request_id: String::new(),
            limit_method,
            limit_size: self.limit_size.unwrap_or_default(),
            limit_seed: self.limit_seed.unwrap_or_else(now_nanos),
            progress: self.progress,
            discovery_start: self.discovery_start,
            discovery_end: self.discovery_end,
            total_stats: Arc::new(Stats::new()),
        })
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}
