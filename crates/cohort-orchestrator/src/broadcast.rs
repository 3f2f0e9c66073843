use crate::config::BroadcastConfig;
use crate::metrics::{KpiScope, MetricSummary};
use crate::store::StateStore;
use crate::types::{AgentState, FailureReason};
use chrono::{DateTime, Utc};
use cohort_core::{AgentId, Alert, Department, TaskId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Subscription topic. Every event belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Tasks,
    Alerts,
    Kpis,
    Agents,
}

impl Topic {
    pub const ALL: [Topic; 4] = [Topic::Tasks, Topic::Alerts, Topic::Kpis, Topic::Agents];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Tasks => "tasks",
            Topic::Alerts => "alerts",
            Topic::Kpis => "kpis",
            Topic::Agents => "agents",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change the engine publishes to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    TaskAssigned {
        task_id: TaskId,
        agent_id: AgentId,
        attempt: u32,
    },
    TaskCompleted {
        task_id: TaskId,
        agent_id: AgentId,
    },
    TaskFailed {
        task_id: TaskId,
        reason: FailureReason,
        attempts: u32,
    },
    Alert {
        alert: Alert,
    },
    KpiUpdated {
        scope: KpiScope,
        metric: String,
        summary: MetricSummary,
    },
    AgentStateChanged {
        agent_id: AgentId,
        department: Department,
        from: AgentState,
        to: AgentState,
    },
}

impl EngineEvent {
    pub fn topic(&self) -> Topic {
        match self {
            EngineEvent::TaskAssigned { .. }
            | EngineEvent::TaskCompleted { .. }
            | EngineEvent::TaskFailed { .. } => Topic::Tasks,
            EngineEvent::Alert { .. } => Topic::Alerts,
            EngineEvent::KpiUpdated { .. } => Topic::Kpis,
            EngineEvent::AgentStateChanged { .. } => Topic::Agents,
        }
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    pub topic: Topic,
    /// Publish order across all topics, starting at 1.
    pub sequence: u64,
    pub published_at: DateTime<Utc>,
    pub event: EngineEvent,
}

/// Receiving end handed out by [`EventBroadcaster::subscribe`].
pub struct Subscription {
    pub id: Uuid,
    pub rx: mpsc::Receiver<BroadcastEnvelope>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<BroadcastEnvelope> {
        self.rx.recv().await
    }

    /// Next envelope if one is already buffered.
    pub fn try_recv(&mut self) -> Option<BroadcastEnvelope> {
        self.rx.try_recv().ok()
    }
}

struct Subscriber {
    topics: Vec<Topic>,
    tx: mpsc::Sender<BroadcastEnvelope>,
}

impl Subscriber {
    fn wants(&self, topic: Topic) -> bool {
        self.topics.is_empty() || self.topics.contains(&topic)
    }
}

struct StoreForwarder {
    tx: Option<mpsc::Sender<(Topic, String)>>,
    task: Option<JoinHandle<()>>,
}

/// Best-effort fan-out of engine events.
///
/// `publish` never waits: a subscriber whose buffer is full misses the
/// event, and closed subscribers are pruned on the spot.
pub struct EventBroadcaster {
    config: BroadcastConfig,
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
    sequence: AtomicU64,
    dropped: AtomicU64,
    forwarder: Mutex<StoreForwarder>,
}

impl EventBroadcaster {
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            config,
            subscribers: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            forwarder: Mutex::new(StoreForwarder {
                tx: None,
                task: None,
            }),
        }
    }

    /// Also forward every event to `<prefix>:<topic>` on the state store.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_store(config: BroadcastConfig, store: Arc<dyn StateStore>) -> Self {
        let (tx, rx) = mpsc::channel(config.subscriber_buffer);
        let prefix = config.store_channel_prefix.clone();
        let task = tokio::spawn(forward_to_store(store, prefix, rx));
        let broadcaster = Self::new(config);
        *broadcaster.forwarder.lock() = StoreForwarder {
            tx: Some(tx),
            task: Some(task),
        };
        broadcaster
    }

    /// Subscribe to the given topics. An empty slice means every topic.
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer);
        self.subscribers.lock().insert(
            id,
            Subscriber {
                topics: topics.to_vec(),
                tx,
            },
        );
        debug!(subscriber = %id, ?topics, "Broadcast subscriber added");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: Uuid) -> bool {
        self.subscribers.lock().remove(&id).is_some()
    }

    /// Queue `event` for every interested subscriber and return immediately.
    pub fn publish(&self, event: EngineEvent) {
        let topic = event.topic();
        let envelope = BroadcastEnvelope {
            topic,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            published_at: Utc::now(),
            event,
        };

        {
            let mut subscribers = self.subscribers.lock();
            let mut closed = Vec::new();
            for (id, sub) in subscribers.iter().filter(|(_, s)| s.wants(topic)) {
                match sub.tx.try_send(envelope.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(subscriber = %id, %topic, "Subscriber lagging, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
            for id in closed {
                subscribers.remove(&id);
                debug!(subscriber = %id, "Closed broadcast subscriber pruned");
            }
        }

        let forwarder = self.forwarder.lock();
        if let Some(tx) = forwarder.tx.as_ref() {
            match serde_json::to_string(&envelope) {
                Ok(json) => {
                    if tx.try_send((topic, json)).is_err() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) => warn!(error = %e, "Failed to serialize event for state store"),
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Events not delivered to some subscriber (or the store) because it was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events published so far.
    pub fn published_count(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Stop forwarding to the store once the queued events are written.
    pub async fn shutdown(&self) {
        let task = {
            let mut forwarder = self.forwarder.lock();
            forwarder.tx = None;
            forwarder.task.take()
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "State store forwarder ended abnormally");
            }
        }
    }
}

async fn forward_to_store(
    store: Arc<dyn StateStore>,
    prefix: String,
    mut rx: mpsc::Receiver<(Topic, String)>,
) {
    while let Some((topic, json)) = rx.recv().await {
        let channel = format!("{prefix}:{topic}");
        if let Err(e) = store.publish(&channel, &json).await {
            warn!(channel = %channel, error = %e, "Failed to forward event to state store");
        }
    }
}
