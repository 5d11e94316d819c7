//! In-process broker implementing the Choria publish/subscribe contract.
//!
//! Subjects match exactly. Subscribers sharing a queue group receive each
//! message once between them, picked round-robin; ungrouped subscribers all
//! receive a copy. Delivery never blocks: a full subscriber queue drops the
//! message, matching the at-most-once semantics of the real network.

use crate::connector::{Connector, ConnectorFactory};
use crate::error::{ClientError, Result};
use crate::message::{ConnectorMessage, Message};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

struct Subscription {
    connection_id: u64,
    name: String,
    group: String,
    output: mpsc::Sender<ConnectorMessage>,
    token: CancellationToken,
}

impl Subscription {
    fn is_live(&self) -> bool {
        !self.token.is_cancelled() && !self.output.is_closed()
    }
}

#[derive(Default)]
struct BrokerInner {
    subjects: Mutex<HashMap<String, Vec<Subscription>>>,
    published: Mutex<Vec<Message>>,
    connections: Mutex<Vec<String>>,
    next_connection_id: AtomicU64,
    round_robin: AtomicUsize,
    fail_publish: AtomicBool,
}

/// A cloneable handle to an in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a connection to this broker.
    pub fn connection(&self, name: &str) -> MemoryConnector {
        let id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.inner.connections.lock().push(name.to_string());
        debug!(connection = %name, id, "memory broker connection opened");

        MemoryConnector {
            broker: self.clone(),
            id,
            name: name.to_string(),
            closed: AtomicBool::new(false),
        }
    }

    /// Publishes raw data to a subject, as agents do when replying.
    ///
    /// Returns how many subscribers the data was delivered to.
    pub fn publish_raw(&self, subject: &str, data: impl Into<Bytes>) -> usize {
        self.deliver(ConnectorMessage::new(subject, data))
    }

    /// Makes every subsequent publish through a connection fail.
    pub fn set_publish_failure(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Requests published through connections so far, in publish order.
    pub fn published(&self) -> Vec<Message> {
        self.inner.published.lock().clone()
    }

    /// Names of every connection opened so far.
    pub fn connection_names(&self) -> Vec<String> {
        self.inner.connections.lock().clone()
    }

    /// Number of live subscriptions on `subject`.
    pub fn subscription_count(&self, subject: &str) -> usize {
        self.inner
            .subjects
            .lock()
            .get(subject)
            .map(|subs| subs.iter().filter(|s| s.is_live()).count())
            .unwrap_or(0)
    }

    fn subscribe(&self, sub: Subscription, subject: &str) {
        let mut subjects = self.inner.subjects.lock();
        subjects.entry(subject.to_string()).or_default().push(sub);
    }

    fn drop_connection(&self, connection_id: u64) {
        let mut subjects = self.inner.subjects.lock();
        for subs in subjects.values_mut() {
            subs.retain(|s| s.connection_id != connection_id);
        }
        subjects.retain(|_, subs| !subs.is_empty());
    }

    fn deliver(&self, msg: ConnectorMessage) -> usize {
        let mut subjects = self.inner.subjects.lock();
        let Some(subs) = subjects.get_mut(&msg.subject) else {
            trace!(subject = %msg.subject, "no subscribers");
            return 0;
        };

        subs.retain(|s| s.is_live());

        let mut targets: Vec<usize> = Vec::new();
        let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
        for (idx, sub) in subs.iter().enumerate() {
            if sub.group.is_empty() {
                targets.push(idx);
            } else {
                groups.entry(sub.group.as_str()).or_default().push(idx);
            }
        }

        for members in groups.values() {
            let pick = self.inner.round_robin.fetch_add(1, Ordering::Relaxed) % members.len();
            targets.push(members[pick]);
        }

        let mut delivered = 0;
        for idx in targets {
            let sub = &subs[idx];
            match sub.output.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(subscription = %sub.name, subject = %msg.subject, error = %e, "dropping message"),
            }
        }

        delivered
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("subjects", &self.inner.subjects.lock().len())
            .field("published", &self.inner.published.lock().len())
            .finish()
    }
}

#[async_trait]
impl ConnectorFactory for MemoryBroker {
    async fn connect(&self, name: &str) -> Result<Arc<dyn Connector>> {
        Ok(Arc::new(self.connection(name)))
    }
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryConnector {
    broker: MemoryBroker,
    id: u64,
    name: String,
    closed: AtomicBool,
}

impl MemoryConnector {
    /// Returns true once the connection was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn queue_subscribe(
        &self,
        token: CancellationToken,
        name: &str,
        subject: &str,
        group: &str,
        output: mpsc::Sender<ConnectorMessage>,
    ) -> Result<()> {
        self.ensure_open()?;

        if subject.is_empty() {
            return Err(ClientError::Subscribe {
                subject: subject.to_string(),
                reason: "subject cannot be empty".to_string(),
            });
        }

        debug!(connection = %self.name, subscription = %name, subject = %subject, group = %group, "subscribing");

        self.broker.subscribe(
            Subscription {
                connection_id: self.id,
                name: name.to_string(),
                group: group.to_string(),
                output,
                token,
            },
            subject,
        );

        Ok(())
    }

    async fn publish(&self, msg: &Message) -> Result<()> {
        self.ensure_open()?;

        if self.broker.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(ClientError::Publish {
                request_id: msg.request_id().to_string(),
                reason: "broker rejected publish".to_string(),
            });
        }

        let subjects = msg.publish_subjects();
        if subjects.is_empty() {
            return Err(ClientError::Publish {
                request_id: msg.request_id().to_string(),
                reason: "request has no targets".to_string(),
            });
        }

        let data = Bytes::from(msg.to_transport()?);
        self.broker.inner.published.lock().push(msg.clone());

        for subject in subjects {
            let mut out = ConnectorMessage::new(&subject, data.clone());
            out.reply = Some(msg.reply_to().to_string());
            self.broker.deliver(out);
        }

        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(connection = %self.name, "closing connection");
            self.broker.drop_connection(self.id);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
