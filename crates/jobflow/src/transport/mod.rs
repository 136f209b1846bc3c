//! Wake-up notifications for consumers.
//!
//! A notification only carries a job id. Consumers always re-read state via
//! `claim`, so lost, duplicated or stale notifications are harmless; the
//! polling interval covers anything the transport drops.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{JobsError, Result};

const CHANNEL_PREFIX: &str = "jobflow.";
const SUBSCRIPTION_BUFFER: usize = 256;
const LISTENER_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub queue: String,
    pub job_id: Uuid,
}

pub fn channel_name(queue: &str) -> String {
    format!("{CHANNEL_PREFIX}{queue}")
}

fn queue_from_channel(channel: &str) -> Option<&str> {
    channel.strip_prefix(CHANNEL_PREFIX)
}

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Best-effort: a failed publish never affects the job itself.
    async fn publish(&self, queue: &str, job_id: Uuid) -> Result<()>;

    async fn subscribe(&self, queues: &[String]) -> Result<Subscription>;
}

/// Publish `job_id` once `delay` has elapsed. Used after a retry is
/// scheduled so an idle consumer wakes up at `run_after`.
pub fn publish_later(
    notifier: Arc<dyn Notifier>,
    queue: String,
    job_id: Uuid,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(e) = notifier.publish(&queue, job_id).await {
            debug!(%job_id, queue = %queue, error = %e, "delayed publish failed");
        }
    })
}

/// Stream of notifications for a set of queues. Dropping it stops the
/// background forwarder.
pub struct Subscription {
    rx: mpsc::Receiver<Notification>,
    forwarder: JoinHandle<()>,
}

impl Subscription {
    /// `None` once the underlying transport is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

fn forward(tx: &mpsc::Sender<Notification>, n: Notification) -> bool {
    match tx.try_send(n) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(n)) => {
            debug!(job_id = %n.job_id, queue = %n.queue, "subscription full, dropping notification");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Per-queue view of a shared broadcast stream.
fn fan_out(mut source: broadcast::Receiver<Notification>, queues: Vec<String>) -> Subscription {
    let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
    let forwarder = tokio::spawn(async move {
        loop {
            match source.recv().await {
                Ok(n) => {
                    if queues.contains(&n.queue) && !forward(&tx, n) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    Subscription { rx, forwarder }
}

/// PostgreSQL `LISTEN/NOTIFY` on channel `jobflow.<queue>`.
///
/// All subscriptions made through one notifier (and its clones) share a
/// single `PgListener`, so a process holds one pool connection for
/// notifications however many consumers it runs.
#[derive(Clone)]
pub struct PgNotifier {
    pool: PgPool,
    hub: Arc<Mutex<Option<ListenerHub>>>,
}

struct ListenerHub {
    events: broadcast::Sender<Notification>,
    listening: HashSet<String>,
    requests: mpsc::Sender<ListenRequest>,
}

struct ListenRequest {
    channels: Vec<String>,
    done: oneshot::Sender<sqlx::Result<()>>,
}

impl PgNotifier {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            hub: Arc::new(Mutex::new(None)),
        }
    }
}

impl ListenerHub {
    async fn start(pool: &PgPool) -> Result<Self> {
        let listener = PgListener::connect_with(pool).await.map_err(transport)?;
        let (events, _) = broadcast::channel(LISTENER_BUFFER);
        let (requests, rx) = mpsc::channel(16);
        tokio::spawn(run_listener(listener, events.clone(), rx));
        debug!("notification listener started");

        Ok(Self {
            events,
            listening: HashSet::new(),
            requests,
        })
    }

    async fn listen(&mut self, channels: &[String]) -> Result<()> {
        let missing: Vec<String> = channels
            .iter()
            .filter(|c| !self.listening.contains(*c))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let (done, ack) = oneshot::channel();
        self.requests
            .send(ListenRequest {
                channels: missing.clone(),
                done,
            })
            .await
            .map_err(|_| JobsError::Transport("notification listener stopped".into()))?;
        ack.await
            .map_err(|_| JobsError::Transport("notification listener stopped".into()))?
            .map_err(transport)?;

        self.listening.extend(missing);
        Ok(())
    }
}

/// Owns the listener connection. Exits once every `PgNotifier` clone is gone.
async fn run_listener(
    mut listener: PgListener,
    events: broadcast::Sender<Notification>,
    mut requests: mpsc::Receiver<ListenRequest>,
) {
    loop {
        tokio::select! {
            req = requests.recv() => {
                let Some(req) = req else { break };
                let res = listener
                    .listen_all(req.channels.iter().map(String::as_str))
                    .await;
                let _ = req.done.send(res);
            }
            msg = listener.recv() => match msg {
                Ok(msg) => {
                    let Some(queue) = queue_from_channel(msg.channel()) else {
                        continue;
                    };
                    let Ok(job_id) = msg.payload().parse::<Uuid>() else {
                        debug!(payload = msg.payload(), "ignoring malformed notification");
                        continue;
                    };
                    // no subscribers is fine
                    let _ = events.send(Notification {
                        queue: queue.to_string(),
                        job_id,
                    });
                }
                Err(e) => {
                    // recv reconnects and re-listens on the next call
                    warn!(error = %e, "notification listener error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
        }
    }
    debug!("notification listener stopped");
}

fn transport(e: sqlx::Error) -> JobsError {
    JobsError::Transport(e.to_string())
}

#[async_trait]
impl Notifier for PgNotifier {
    async fn publish(&self, queue: &str, job_id: Uuid) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel_name(queue))
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn subscribe(&self, queues: &[String]) -> Result<Subscription> {
        let channels: Vec<String> = queues.iter().map(|q| channel_name(q)).collect();

        let mut hub = self.hub.lock().await;
        if hub.as_ref().map_or(true, |h| h.requests.is_closed()) {
            *hub = Some(ListenerHub::start(&self.pool).await?);
        }
        let shared = hub
            .as_mut()
            .ok_or_else(|| JobsError::Transport("notification listener unavailable".into()))?;
        shared.listen(&channels).await?;

        Ok(fan_out(shared.events.subscribe(), queues.to_vec()))
    }
}

/// In-process transport over a tokio broadcast channel.
#[derive(Clone)]
pub struct LocalNotifier {
    tx: broadcast::Sender<Notification>,
}

impl Default for LocalNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LISTENER_BUFFER);
        Self { tx }
    }
}

#[async_trait]
impl Notifier for LocalNotifier {
    async fn publish(&self, queue: &str, job_id: Uuid) -> Result<()> {
        // no subscribers is fine
        let _ = self.tx.send(Notification {
            queue: queue.to_string(),
            job_id,
        });
        Ok(())
    }

    async fn subscribe(&self, queues: &[String]) -> Result<Subscription> {
        Ok(fan_out(self.tx.subscribe(), queues.to_vec()))
    }
}
