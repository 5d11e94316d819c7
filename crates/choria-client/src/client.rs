//! Single-shot publish/receive engine.
//!
//! A [`Client`] publishes one message and, when replies are wanted, runs a
//! pool of receivers subscribed to the reply subject. Replies are handed to
//! the caller's handler one at a time, in arrival order, until the handler
//! cancels, the idle timeout passes without a reply, or the caller cancels.
//!
//! The client knows nothing about RPC semantics; discovery, batching and
//! reply classification are built on top of it.

use crate::connector::Connector;
use crate::error::{ClientError, Result};
use crate::framework::Framework;
use crate::message::{ConnectorMessage, Message};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Processes one raw reply. The token is the one governing the request;
/// cancelling it ends the request early.
pub type Handler = Arc<dyn Fn(&CancellationToken, ConnectorMessage) + Send + Sync>;

/// Called synchronously around the publish.
pub type PublishHook = Arc<dyn Fn() + Send + Sync>;

/// Whether a request expects replies.
#[derive(Clone)]
pub enum ReplyMode {
    /// Publish only. Used when replies go to a subject nobody here listens on.
    NoReplyExpected,
    /// Start receivers and pass every reply to the handler.
    Handled(Handler),
}

impl ReplyMode {
    /// Wraps a closure as a [`ReplyMode::Handled`].
    pub fn handled<F>(f: F) -> Self
    where
        F: Fn(&CancellationToken, ConnectorMessage) + Send + Sync + 'static,
    {
        ReplyMode::Handled(Arc::new(f))
    }
}

impl std::fmt::Debug for ReplyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyMode::NoReplyExpected => write!(f, "NoReplyExpected"),
            ReplyMode::Handled(_) => write!(f, "Handled"),
        }
    }
}

/// Options for building a [`Client`].
#[derive(Clone)]
pub struct ClientOptions {
    /// Number of concurrent reply receivers (default: 1).
    pub receivers: usize,
    /// Idle timeout, defaults to the configured discovery timeout.
    pub timeout: Option<Duration>,
    /// Base name for connections the client opens.
    pub name: Option<String>,
    /// Pre-built connection to use instead of opening new ones.
    pub connection: Option<Arc<dyn Connector>>,
    /// Called right before publishing.
    pub on_publish_start: Option<PublishHook>,
    /// Called right after publishing.
    pub on_publish_finish: Option<PublishHook>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            receivers: 1,
            timeout: None,
            name: None,
            connection: None,
            on_publish_start: None,
            on_publish_finish: None,
        }
    }
}

impl ClientOptions {
    /// Sets the receiver count.
    pub fn receivers(mut self, receivers: usize) -> Self {
        self.receivers = receivers;
        self
    }

    /// Sets the idle timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the connection base name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Uses an existing connection.
    pub fn connection(mut self, conn: Arc<dyn Connector>) -> Self {
        self.connection = Some(conn);
        self
    }

    /// Sets the publish start hook.
    pub fn on_publish_start(mut self, hook: PublishHook) -> Self {
        self.on_publish_start = Some(hook);
        self
    }

    /// Sets the publish finish hook.
    pub fn on_publish_finish(mut self, hook: PublishHook) -> Self {
        self.on_publish_finish = Some(hook);
        self
    }
}

/// Low level publish/receive client.
pub struct Client {
    fw: Arc<Framework>,
    receivers: usize,
    timeout: Duration,
    name: String,
    connection: Option<Arc<dyn Connector>>,
    on_publish_start: Option<PublishHook>,
    on_publish_finish: Option<PublishHook>,
    queue_size: usize,
}

impl Client {
    /// Creates a client. Fails when no receivers are requested.
    pub fn new(fw: Arc<Framework>, opts: ClientOptions) -> Result<Self> {
        if opts.receivers == 0 {
            return Err(ClientError::Config {
                msg: "receivers should be more than 0".to_string(),
            });
        }

        let timeout = opts
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or_else(|| fw.config().discovery_timeout());
        let name = opts
            .name
            .unwrap_or_else(|| format!("{}-{}", fw.identity(), fw.new_request_id()));
        let queue_size = fw.config().reply_queue_size;

        Ok(Self {
            fw,
            receivers: opts.receivers,
            timeout,
            name,
            connection: opts.connection,
            on_publish_start: opts.on_publish_start,
            on_publish_finish: opts.on_publish_finish,
            queue_size,
        })
    }

    /// Number of reply receivers.
    pub fn receivers(&self) -> usize {
        self.receivers
    }

    /// Idle timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Connection base name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publishes `msg` and, in [`ReplyMode::Handled`], processes replies
    /// until the handler or caller cancels or the idle timeout passes.
    ///
    /// Running out of time is normal completion; only connection, subscribe
    /// (all receivers) and publish failures are errors.
    pub async fn request(
        &self,
        token: &CancellationToken,
        msg: &Message,
        mode: ReplyMode,
    ) -> Result<()> {
        let token = token.child_token();
        let _guard = token.clone().drop_guard();

        match mode {
            ReplyMode::NoReplyExpected => {
                debug!(request_id = %msg.request_id(), "publishing without reply receivers");
                let conn = self.publisher(&token).await?;
                self.publish(conn.as_ref(), msg).await
            }
            ReplyMode::Handled(handler) => self.request_with_replies(&token, msg, handler).await,
        }
    }

    async fn request_with_replies(
        &self,
        token: &CancellationToken,
        msg: &Message,
        handler: Handler,
    ) -> Result<()> {
        let subject = msg.reply_to().to_string();
        let group = if self.receivers > 1 {
            format!("{}_{}", self.fw.identity(), msg.request_id())
        } else {
            String::new()
        };

        debug!(
            request_id = %msg.request_id(),
            receivers = self.receivers,
            subject = %subject,
            "starting reply receivers"
        );

        let (reply_tx, mut reply_rx) = mpsc::channel(self.queue_size);
        let (ready_tx, mut ready_rx) = mpsc::channel(self.receivers);
        let mut workers = JoinSet::new();

        for id in 0..self.receivers {
            let receiver = Receiver {
                id,
                fw: self.fw.clone(),
                name: format!("{}-receiver{}", self.name, id),
                connection: self.connection.clone(),
                subject: subject.clone(),
                group: group.clone(),
                queue_size: self.queue_size,
                token: token.clone(),
            };
            workers.spawn(receiver.run(reply_tx.clone(), ready_tx.clone()));
        }
        drop(reply_tx);
        drop(ready_tx);

        let ready = tokio::select! {
            _ = token.cancelled() => {
                debug!(request_id = %msg.request_id(), "cancelled before any receiver was ready");
                while workers.join_next().await.is_some() {}
                return Ok(());
            }
            ready = ready_rx.recv() => ready,
        };

        if ready.is_none() {
            while workers.join_next().await.is_some() {}
            return Err(ClientError::NoReceivers { subject });
        }

        let published = match self.publisher(token).await {
            Ok(conn) => self.publish(conn.as_ref(), msg).await,
            Err(e) => Err(e),
        };

        if let Err(e) = published {
            error!(request_id = %msg.request_id(), error = %e, "publish failed");
            token.cancel();
            while workers.join_next().await.is_some() {}
            return Err(e);
        }

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(request_id = %msg.request_id(), "request finished");
                    break;
                }
                next = tokio::time::timeout(self.timeout, reply_rx.recv()) => match next {
                    Ok(Some(reply)) => handler(token, reply),
                    Ok(None) => {
                        debug!(request_id = %msg.request_id(), "all reply receivers stopped");
                        break;
                    }
                    Err(_) => {
                        debug!(request_id = %msg.request_id(), timeout = ?self.timeout, "timeout while waiting for replies");
                        break;
                    }
                },
            }
        }

        token.cancel();
        while workers.join_next().await.is_some() {}

        Ok(())
    }

    async fn publisher(&self, token: &CancellationToken) -> Result<Arc<dyn Connector>> {
        match &self.connection {
            Some(conn) => Ok(conn.clone()),
            None => {
                self.fw
                    .new_connector(token, &format!("{}-publisher", self.name))
                    .await
            }
        }
    }

    async fn publish(&self, conn: &dyn Connector, msg: &Message) -> Result<()> {
        if let Some(hook) = &self.on_publish_start {
            hook();
        }

        let result = conn.publish(msg).await;

        if let Some(hook) = &self.on_publish_finish {
            hook();
        }

        result
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name)
            .field("receivers", &self.receivers)
            .field("timeout", &self.timeout)
            .field("shared_connection", &self.connection.is_some())
            .finish()
    }
}

struct Receiver {
    id: usize,
    fw: Arc<Framework>,
    name: String,
    connection: Option<Arc<dyn Connector>>,
    subject: String,
    group: String,
    queue_size: usize,
    token: CancellationToken,
}

impl Receiver {
    async fn run(self, replies: mpsc::Sender<ConnectorMessage>, ready: mpsc::Sender<()>) {
        let conn = match self.connection {
            Some(conn) => conn,
            None => match self.fw.new_connector(&self.token, &self.name).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(receiver = self.id, error = %e, "could not connect reply receiver");
                    return;
                }
            },
        };

        let (sub_tx, mut sub_rx) = mpsc::channel(self.queue_size);
        if let Err(e) = conn
            .queue_subscribe(self.token.clone(), "replies", &self.subject, &self.group, sub_tx)
            .await
        {
            warn!(receiver = self.id, subject = %self.subject, error = %e, "could not subscribe to replies");
            return;
        }

        let _ = ready.send(()).await;
        drop(ready);

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                msg = sub_rx.recv() => {
                    let Some(msg) = msg else { break };
                    tokio::select! {
                        biased;
                        _ = self.token.cancelled() => break,
                        sent = replies.send(msg) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}
