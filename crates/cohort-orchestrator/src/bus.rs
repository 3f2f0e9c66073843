//! Communication bus: at-least-once delivery between the orchestrator and agents.
//!
//! Every `(sender, recipient)` pair gets its own lane, a bounded queue drained
//! by one worker. The worker delivers one message at a time and does not
//! start on the next until the current one is acknowledged or has exhausted
//! its retry budget, so messages on a lane arrive in send order. Lanes of
//! different pairs run independently.
//!
//! A delivery attempt succeeds when the recipient's [`MessageHandler`]
//! returns `Ok` within the ack timeout. Failed attempts are retried with
//! exponential backoff plus random jitter. Recipients must tolerate
//! duplicates: an attempt that timed out may still have been processed.

use crate::config::BusConfig;
use async_trait::async_trait;
use cohort_core::{CohortError, CohortResult, Endpoint, Message};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Receives messages addressed to one endpoint.
///
/// Returning `Ok` acknowledges the message. Returning an error, or not
/// returning within the ack timeout, counts as a failed attempt.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn deliver(&self, message: Message) -> CohortResult<()>;
}

/// Final outcome of a message on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Failed { reason: String },
}

/// What the bus reports back to the sender once a message is settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: Uuid,
    pub recipient: Endpoint,
    pub attempts: u32,
    pub status: DeliveryStatus,
}

impl DeliveryReceipt {
    fn delivered(message: &Message, attempts: u32) -> Self {
        Self {
            message_id: message.id,
            recipient: message.recipient,
            attempts,
            status: DeliveryStatus::Delivered,
        }
    }

    fn failed(message_id: Uuid, recipient: Endpoint, attempts: u32, reason: impl Into<String>) -> Self {
        Self {
            message_id,
            recipient,
            attempts,
            status: DeliveryStatus::Failed {
                reason: reason.into(),
            },
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.status == DeliveryStatus::Delivered
    }

    /// Convert a failed receipt into [`CohortError::DeliveryFailed`].
    pub fn into_result(self) -> CohortResult<()> {
        match self.status {
            DeliveryStatus::Delivered => Ok(()),
            DeliveryStatus::Failed { reason } => Err(CohortError::DeliveryFailed {
                message_id: self.message_id,
                attempts: self.attempts,
                reason,
            }),
        }
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    /// Messages acknowledged by their recipient.
    pub delivered: u64,
    /// Attempts that failed and were retried.
    pub retried: u64,
    /// Messages that exhausted their attempts or were refused.
    pub failed: u64,
    /// Sender/recipient lanes currently open.
    pub lanes: usize,
    /// Endpoints with a subscribed handler.
    pub handlers: usize,
}

struct Envelope {
    message: Message,
    reply: oneshot::Sender<DeliveryReceipt>,
}

type LaneKey = (Endpoint, Endpoint);

struct BusInner {
    config: BusConfig,
    handlers: RwLock<HashMap<Endpoint, Arc<dyn MessageHandler>>>,
    lanes: Mutex<HashMap<LaneKey, mpsc::Sender<Envelope>>>,
    delivered: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Cheaply cloneable handle to the bus.
#[derive(Clone)]
pub struct CommunicationBus {
    inner: Arc<BusInner>,
}

impl CommunicationBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                handlers: RwLock::new(HashMap::new()),
                lanes: Mutex::new(HashMap::new()),
                delivered: AtomicU64::new(0),
                retried: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Route messages for `endpoint` to `handler`, replacing any previous one.
    pub fn subscribe(&self, endpoint: Endpoint, handler: Arc<dyn MessageHandler>) {
        let replaced = self.inner.handlers.write().insert(endpoint, handler).is_some();
        debug!(endpoint = %endpoint, replaced, "Bus handler subscribed");
    }

    /// Remove the handler for `endpoint`. Messages queued for it fail after their retries.
    pub fn unsubscribe(&self, endpoint: Endpoint) -> bool {
        self.inner.handlers.write().remove(&endpoint).is_some()
    }

    pub fn has_handler(&self, endpoint: Endpoint) -> bool {
        self.inner.handlers.read().contains_key(&endpoint)
    }

    /// Queue a message on its lane and return immediately.
    ///
    /// The lane position is fixed by the time this returns, so two calls for
    /// the same pair deliver in call order. The receiver resolves once the
    /// message is delivered or has failed.
    pub fn dispatch(&self, message: Message) -> oneshot::Receiver<DeliveryReceipt> {
        let (reply, rx) = oneshot::channel();
        let inner = &self.inner;

        if inner.cancel.is_cancelled() {
            inner.failed.fetch_add(1, Ordering::Relaxed);
            let _ = reply.send(DeliveryReceipt::failed(
                message.id,
                message.recipient,
                0,
                "bus shut down",
            ));
            return rx;
        }

        let key = (message.sender, message.recipient);
        let mut lanes = inner.lanes.lock();
        let lane = lanes.entry(key).or_insert_with(|| self.open_lane(key));
        let sent = match lane.try_send(Envelope { message, reply }) {
            Err(mpsc::error::TrySendError::Closed(envelope)) => {
                debug!(sender = %key.0, recipient = %key.1, "Bus lane worker gone, reopening");
                let lane = self.open_lane(key);
                let sent = lane.try_send(envelope);
                lanes.insert(key, lane);
                sent
            }
            other => other,
        };
        if let Err(err) = sent {
            let (envelope, reason) = match err {
                mpsc::error::TrySendError::Full(e) => (e, "lane full"),
                mpsc::error::TrySendError::Closed(e) => (e, "lane closed"),
            };
            warn!(
                message_id = %envelope.message.id,
                sender = %key.0,
                recipient = %key.1,
                reason,
                "Message refused by bus"
            );
            inner.failed.fetch_add(1, Ordering::Relaxed);
            let _ = envelope.reply.send(DeliveryReceipt::failed(
                envelope.message.id,
                envelope.message.recipient,
                0,
                reason,
            ));
        }
        rx
    }

    /// Queue a message and wait for its receipt.
    pub async fn send(&self, message: Message) -> DeliveryReceipt {
        let (id, recipient) = (message.id, message.recipient);
        self.dispatch(message)
            .await
            .unwrap_or_else(|_| DeliveryReceipt::failed(id, recipient, 0, "bus dropped the message"))
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            retried: self.inner.retried.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            lanes: self.inner.lanes.lock().len(),
            handlers: self.inner.handlers.read().len(),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Stop every lane. Messages not yet delivered fail with "bus shut down".
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.lanes.lock().clear();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!(stats = ?self.stats(), "Communication bus stopped");
    }

    fn open_lane(&self, key: LaneKey) -> mpsc::Sender<Envelope> {
        let (tx, rx) = mpsc::channel(self.inner.config.lane_capacity);
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(run_lane(inner, rx));
        debug!(sender = %key.0, recipient = %key.1, "Bus lane opened");
        tx
    }
}

async fn run_lane(inner: Arc<BusInner>, mut rx: mpsc::Receiver<Envelope>) {
    loop {
        let envelope = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => return,
            },
        };
        let receipt = inner.deliver_with_retry(envelope.message).await;
        let _ = envelope.reply.send(receipt);
    }

    rx.close();
    while let Ok(envelope) = rx.try_recv() {
        inner.failed.fetch_add(1, Ordering::Relaxed);
        let _ = envelope.reply.send(DeliveryReceipt::failed(
            envelope.message.id,
            envelope.message.recipient,
            0,
            "bus shut down",
        ));
    }
}

impl BusInner {
    async fn deliver_with_retry(&self, mut message: Message) -> DeliveryReceipt {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            message.delivery_attempts = attempt;

            match self.attempt(&message).await {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    if attempt > 1 {
                        debug!(message_id = %message.id, attempt, "Message delivered after retry");
                    }
                    return DeliveryReceipt::delivered(&message, attempt);
                }
                Err(reason) => last_error = reason,
            }

            if self.cancel.is_cancelled() {
                last_error = "bus shut down".into();
                return self.give_up(&message, attempt, last_error);
            }

            if attempt < max_attempts {
                self.retried.fetch_add(1, Ordering::Relaxed);
                let delay = jittered_backoff(&self.config, attempt - 1);
                warn!(
                    message_id = %message.id,
                    recipient = %message.recipient,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "Delivery attempt failed, retrying"
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return self.give_up(&message, attempt, "bus shut down");
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        self.give_up(&message, max_attempts, last_error)
    }

    async fn attempt(&self, message: &Message) -> Result<(), String> {
        let handler = self.handlers.read().get(&message.recipient).cloned();
        let Some(handler) = handler else {
            return Err(format!("no handler for {}", message.recipient));
        };

        // The handler runs in its own task so a panic fails the attempt, not the lane.
        let message = message.clone();
        let mut delivery = self
            .tracker
            .spawn(async move { handler.deliver(message).await });

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err("bus shut down".to_string()),
            outcome = tokio::time::timeout(self.config.ack_timeout(), &mut delivery) => {
                match outcome {
                    Ok(Ok(Ok(()))) => Ok(()),
                    Ok(Ok(Err(e))) => Err(e.to_string()),
                    Ok(Err(e)) if e.is_panic() => Err("handler panicked".into()),
                    Ok(Err(_)) => Err("handler cancelled".into()),
                    Err(_) => Err("ack timeout".into()),
                }
            }
        };
        if outcome.is_err() {
            delivery.abort();
        }
        outcome
    }

    fn give_up(&self, message: &Message, attempts: u32, reason: impl Into<String>) -> DeliveryReceipt {
        let reason = reason.into();
        self.failed.fetch_add(1, Ordering::Relaxed);
        warn!(
            message_id = %message.id,
            recipient = %message.recipient,
            kind = %message.kind(),
            attempts,
            reason = %reason,
            "Message delivery failed"
        );
        DeliveryReceipt::failed(message.id, message.recipient, attempts, reason)
    }
}

/// Compute the backoff delay for a given attempt number (0-indexed).
fn compute_backoff(config: &BusConfig, attempt: u32) -> u64 {
    let delay = config
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    delay.min(config.backoff_max_ms)
}

fn jittered_backoff(config: &BusConfig, attempt: u32) -> Duration {
    let jitter = if config.jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=config.jitter_ms)
    } else {
        0
    };
    Duration::from_millis(compute_backoff(config, attempt) + jitter)
}
