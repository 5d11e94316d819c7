//! Per-request and per-batch statistics.
//!
//! A [`Stats`] tracks which discovered nodes are still outstanding, who
//! replied without being asked, how replies were classified and how long the
//! request phases took. Receivers update it concurrently; the orchestrator
//! folds each batch into a request-wide total with [`Stats::merge`].

use crate::error::{Result, RpcError};
use crate::nodelist::NodeList;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Default)]
struct Timings {
    request_id: String,
    agent: String,
    action: String,
    discovered: Vec<String>,
    start: Option<Instant>,
    end: Option<Instant>,
    publish_start: Option<Instant>,
    publish_end: Option<Instant>,
    publish_total: Duration,
    publish_spans: u32,
    publishing: bool,
    discovery_start: Option<Instant>,
    discovery_end: Option<Instant>,
}

/// Statistics for a request or one batch of it.
#[derive(Debug, Default)]
pub struct Stats {
    outstanding: NodeList,
    unexpected: NodeList,
    responses: AtomicUsize,
    passed: AtomicUsize,
    failed: AtomicUsize,
    progress_started: AtomicBool,
    inner: Mutex<Timings>,
}

impl Stats {
    /// Creates empty statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the nodes this request expects replies from, resetting the
    /// outstanding set to match.
    pub fn set_discovered_nodes(&self, nodes: &[String]) {
        let mut inner = self.inner.lock();
        inner.discovered = nodes.to_vec();

        self.outstanding.clear();
        self.outstanding.add(nodes.iter().cloned());
    }

    /// Nodes this request expects replies from.
    pub fn discovered_nodes(&self) -> Vec<String> {
        self.inner.lock().discovered.clone()
    }

    /// Records that `sender` replied.
    ///
    /// Known senders leave the outstanding set; anyone else is recorded as
    /// an unexpected responder. `all()` reflects the update on return.
    pub fn record_received(&self, sender: &str) {
        let _inner = self.inner.lock();

        self.responses.fetch_add(1, Ordering::SeqCst);

        if !self.outstanding.delete_if_known(sender) {
            self.unexpected.add([sender]);
        }
    }

    /// Counts a reply classified as failed.
    pub fn failed_request_inc(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a reply classified as successful.
    pub fn passed_request_inc(&self) {
        self.passed.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns true once every discovered node replied.
    pub fn all(&self) -> bool {
        self.outstanding.count() == 0
    }

    /// Discovered nodes that have not replied.
    pub fn no_response_from(&self) -> Vec<String> {
        self.outstanding.hosts()
    }

    /// Nodes that replied without being discovered.
    pub fn unexpected_response_from(&self) -> Vec<String> {
        self.unexpected.hosts()
    }

    /// Returns true when any of `nodes` is still outstanding.
    pub fn waiting_for<S: AsRef<str>>(&self, nodes: &[S]) -> bool {
        let _inner = self.inner.lock();
        self.outstanding.have_any(nodes)
    }

    /// Number of discovered nodes.
    pub fn discovered_count(&self) -> usize {
        self.inner.lock().discovered.len()
    }

    /// Number of failed replies.
    pub fn fail_count(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Number of successful replies.
    pub fn ok_count(&self) -> usize {
        self.passed.load(Ordering::SeqCst)
    }

    /// Number of replies received so far.
    pub fn responses_count(&self) -> usize {
        self.responses.load(Ordering::SeqCst)
    }

    /// Folds a completed batch into these statistics.
    ///
    /// When `other` heard from every node all its discovered nodes are
    /// credited, otherwise only those no longer outstanding. Unexpected
    /// responders, pass/fail counters and publish time add up. Counters are
    /// merged even when `other` never published; that case is then reported
    /// as [`RpcError::PublishIncomplete`].
    pub fn merge(&self, other: &Stats) -> Result<()> {
        let discovered = other.discovered_nodes();
        let credited: Vec<String> = if other.all() {
            discovered
        } else {
            discovered
                .into_iter()
                .filter(|n| !other.outstanding.have(n))
                .collect()
        };

        for node in &credited {
            self.record_received(node);
        }

        self.unexpected.add(other.unexpected_response_from());

        self.passed.fetch_add(other.ok_count(), Ordering::SeqCst);
        self.failed.fetch_add(other.fail_count(), Ordering::SeqCst);

        let published = other.publish_duration()?;

        let mut inner = self.inner.lock();
        inner.publish_total += published;
        inner.publish_spans += 1;

        Ok(())
    }

    /// Logs a progress line every second until `token` is cancelled.
    /// Only the first call starts a reporter.
    pub fn start_progress(self: &Arc<Self>, token: CancellationToken) {
        if self.progress_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let stats = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        info!(
                            ok = stats.ok_count(),
                            failed = stats.fail_count(),
                            received = stats.responses_count(),
                            discovered = stats.discovered_count(),
                            "request progress"
                        );
                    }
                }
            }
        });
    }

    /// Marks the start of a publish; ignored while already publishing.
    pub fn start_publish(&self) {
        let mut inner = self.inner.lock();
        if inner.publishing {
            return;
        }

        inner.publish_start = Some(Instant::now());
        inner.publishing = true;
    }

    /// Marks the end of a publish; ignored when not publishing.
    pub fn end_publish(&self) {
        let mut inner = self.inner.lock();
        if !inner.publishing {
            return;
        }

        let now = Instant::now();
        inner.publish_end = Some(now);
        inner.publishing = false;
        if let Some(start) = inner.publish_start {
            inner.publish_total += now.duration_since(start);
        }
        inner.publish_spans += 1;
    }

    /// Total time spent publishing.
    pub fn publish_duration(&self) -> Result<Duration> {
        let inner = self.inner.lock();
        if inner.publish_spans == 0 || inner.publishing {
            return Err(RpcError::PublishIncomplete);
        }

        Ok(inner.publish_total)
    }

    /// Time between [`Stats::start`] and [`Stats::end`].
    pub fn request_duration(&self) -> Result<Duration> {
        let inner = self.inner.lock();
        match (inner.start, inner.end) {
            (Some(start), Some(end)) => Ok(end.duration_since(start)),
            _ => Err(RpcError::RequestIncomplete),
        }
    }

    /// Records the request start; later calls are ignored.
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        if inner.start.is_none() {
            inner.start = Some(Instant::now());
        }
    }

    /// Records the request end; later calls are ignored.
    pub fn end(&self) {
        let mut inner = self.inner.lock();
        if inner.end.is_none() {
            inner.end = Some(Instant::now());
        }
    }

    /// When the request started, if it did.
    pub fn started(&self) -> Option<Instant> {
        self.inner.lock().start
    }

    /// Records the discovery start; later calls are ignored.
    pub fn start_discover(&self) {
        let mut inner = self.inner.lock();
        if inner.discovery_start.is_none() {
            inner.discovery_start = Some(Instant::now());
        }
    }

    /// Records the discovery end; later calls are ignored.
    pub fn end_discover(&self) {
        let mut inner = self.inner.lock();
        if inner.discovery_end.is_none() {
            inner.discovery_end = Some(Instant::now());
        }
    }

    /// Replaces the discovery timings, for discovery done elsewhere.
    pub fn override_discovery_time(&self, start: Instant, end: Instant) {
        let mut inner = self.inner.lock();
        inner.discovery_start = Some(start);
        inner.discovery_end = Some(end);
    }

    /// How long discovery took.
    pub fn discovery_duration(&self) -> Result<Duration> {
        let inner = self.inner.lock();
        match (inner.discovery_start, inner.discovery_end) {
            (Some(start), Some(end)) => Ok(end.duration_since(start)),
            _ => Err(RpcError::DiscoveryNotPerformed),
        }
    }

    /// Sets the request id.
    pub fn set_request_id(&self, id: &str) {
        self.inner.lock().request_id = id.to_string();
    }

    /// Request id, empty when unset.
    pub fn unique_request_id(&self) -> String {
        self.inner.lock().request_id.clone()
    }

    /// Sets the agent the request was for.
    pub fn set_agent(&self, agent: &str) {
        self.inner.lock().agent = agent.to_string();
    }

    /// Agent the request was for.
    pub fn agent(&self) -> String {
        self.inner.lock().agent.clone()
    }

    /// Sets the action the request was for.
    pub fn set_action(&self, action: &str) {
        self.inner.lock().action = action.to_string();
    }

    /// Action the request was for.
    pub fn action(&self) -> String {
        self.inner.lock().action.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn published(stats: &Stats) {
        stats.start_publish();
        std::thread::sleep(Duration::from_millis(1));
        stats.end_publish();
    }

    #[test]
    fn test_record_received_known_sender() {
        let stats = Stats::new();
        stats.set_discovered_nodes(&nodes(&["n1", "n2"]));

        stats.record_received("n1");
        assert!(!stats.all());
        assert_eq!(stats.no_response_from(), nodes(&["n2"]));

        stats.record_received("n2");
        assert!(stats.all());
        assert_eq!(stats.responses_count(), 2);
        assert!(stats.unexpected_response_from().is_empty());
    }

    #[test]
    fn test_record_received_unexpected_sender() {
        let stats = Stats::new();
        stats.set_discovered_nodes(&nodes(&["n1", "n2"]));

        stats.record_received("rogue");
        assert_eq!(stats.unexpected_response_from(), nodes(&["rogue"]));
        assert_eq!(stats.no_response_from().len(), 2);
        assert_eq!(stats.responses_count(), 1);
    }

    #[test]
    fn test_set_discovered_nodes_resets_outstanding() {
        let stats = Stats::new();
        stats.set_discovered_nodes(&nodes(&["n1", "n2"]));
        stats.record_received("n1");
        stats.set_discovered_nodes(&nodes(&["n3"]));

        assert_eq!(stats.discovered_count(), 1);
        assert_eq!(stats.no_response_from(), nodes(&["n3"]));
    }

    #[test]
    fn test_waiting_for() {
        let stats = Stats::new();
        stats.set_discovered_nodes(&nodes(&["n1", "n2"]));
        stats.record_received("n1");

        assert!(stats.waiting_for(&["n1", "n2"]));
        assert!(!stats.waiting_for(&["n1"]));
    }

    #[test]
    fn test_pass_fail_counters() {
        let stats = Stats::new();
        stats.passed_request_inc();
        stats.passed_request_inc();
        stats.failed_request_inc();
        assert_eq!(stats.ok_count(), 2);
        assert_eq!(stats.fail_count(), 1);
    }

    #[test]
    fn test_start_publish_is_idempotent() {
        let stats = Stats::new();
        stats.start_publish();
        let first = stats.inner.lock().publish_start;
        std::thread::sleep(Duration::from_millis(2));
        stats.start_publish();
        assert_eq!(stats.inner.lock().publish_start, first);
        assert!(stats.publish_duration().is_err());

        stats.end_publish();
        stats.end_publish();
        assert_eq!(stats.inner.lock().publish_spans, 1);
        assert!(stats.publish_duration().is_ok());
    }

    #[test]
    fn test_publish_totals_add_up() {
        let stats = Stats::new();
        published(&stats);
        let first = stats.publish_duration().unwrap();
        published(&stats);
        assert!(stats.publish_duration().unwrap() > first);
    }

    #[test]
    fn test_durations_fail_until_complete() {
        let stats = Stats::new();
        assert!(matches!(stats.request_duration(), Err(RpcError::RequestIncomplete)));
        assert!(matches!(stats.publish_duration(), Err(RpcError::PublishIncomplete)));
        assert!(matches!(stats.discovery_duration(), Err(RpcError::DiscoveryNotPerformed)));

        stats.start();
        assert!(stats.request_duration().is_err());
        stats.end();
        assert!(stats.request_duration().is_ok());
        assert!(stats.started().is_some());

        stats.start_discover();
        assert!(stats.discovery_duration().is_err());
        stats.end_discover();
        assert!(stats.discovery_duration().is_ok());
    }

    #[test]
    fn test_override_discovery_time() {
        let stats = Stats::new();
        let start = Instant::now();
        let end = start + Duration::from_secs(3);
        stats.override_discovery_time(start, end);
        assert_eq!(stats.discovery_duration().unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn test_merge_complete_batch_credits_all() {
        let total = Stats::new();
        total.set_discovered_nodes(&nodes(&["a1", "a2", "a3", "b1", "b2"]));

        let a = Stats::new();
        a.set_discovered_nodes(&nodes(&["a1", "a2", "a3"]));
        a.record_received("a1");
        a.record_received("a2");
        a.passed_request_inc();
        a.failed_request_inc();
        published(&a);

        let b = Stats::new();
        b.set_discovered_nodes(&nodes(&["b1", "b2"]));
        b.record_received("b1");
        b.record_received("b2");
        b.passed_request_inc();
        b.passed_request_inc();
        published(&b);

        total.merge(&a).unwrap();
        assert_eq!(total.responses_count(), 2);
        assert_eq!(total.no_response_from(), nodes(&["a3", "b1", "b2"]));

        let before = total.responses_count();
        total.merge(&b).unwrap();
        assert_eq!(total.responses_count(), before + b.discovered_count());
        assert_eq!(total.ok_count(), 3);
        assert_eq!(total.fail_count(), 1);
        assert_eq!(total.no_response_from(), nodes(&["a3"]));
        assert!(total.publish_duration().unwrap() >= a.publish_duration().unwrap());
    }

    #[test]
    fn test_merge_carries_unexpected_responders() {
        let total = Stats::new();
        total.set_discovered_nodes(&nodes(&["n1"]));

        let batch = Stats::new();
        batch.set_discovered_nodes(&nodes(&["n1"]));
        batch.record_received("n1");
        batch.record_received("rogue");
        published(&batch);

        total.merge(&batch).unwrap();
        assert!(total.all());
        assert_eq!(total.unexpected_response_from(), nodes(&["rogue"]));
    }

    #[test]
    fn test_merge_unpublished_batch_reports_error_after_counting() {
        let total = Stats::new();
        let batch = Stats::new();
        batch.passed_request_inc();

        assert!(matches!(total.merge(&batch), Err(RpcError::PublishIncomplete)));
        assert_eq!(total.ok_count(), 1);
    }

    #[test]
    fn test_metadata_accessors() {
        let stats = Stats::new();
        stats.set_request_id("abc");
        stats.set_agent("package");
        stats.set_action("status");
        assert_eq!(stats.unique_request_id(), "abc");
        assert_eq!(stats.agent(), "package");
        assert_eq!(stats.action(), "status");
    }

    #[tokio::test]
    async fn test_start_progress_only_once() {
        let stats = Arc::new(Stats::new());
        let token = CancellationToken::new();
        stats.start_progress(token.clone());
        stats.start_progress(token.clone());
        assert!(stats.progress_started.load(Ordering::SeqCst));
        token.cancel();
    }
}
