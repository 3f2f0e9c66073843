use crate::config::OrchestratorConfig;
use crate::registry::AgentRegistry;
use crate::store::StateStore;
use crate::types::{AgentState, Task};
use cohort_core::{CohortResult, TaskId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const WRITE_ATTEMPTS: u32 = 4;
const WRITE_BACKOFF_BASE_MS: u64 = 50;
const WRITE_BACKOFF_MAX_MS: u64 = 2_000;

/// What replicas see for a live agent under `<prefix>:agent:<id>`.
#[derive(Serialize)]
struct LivenessRecord<'a> {
    department: &'a str,
    state: AgentState,
    active_tasks: usize,
    capacity: u32,
    last_seen_at: chrono::DateTime<chrono::Utc>,
}

/// A serialized terminal record the store has not accepted yet.
struct PendingWrite {
    key: String,
    value: String,
}

/// Mirrors engine state into the external store.
///
/// Terminal task statuses are written as soon as they happen. A record the
/// store keeps rejecting stays pending and is retried on every tick and
/// again while stopping; writing the same terminal record twice is harmless.
/// Agent liveness is refreshed on an interval with a TTL equal to the
/// liveness timeout, so an agent that stops being refreshed disappears from
/// the store on its own.
pub(crate) struct StateReplicator {
    store: Arc<dyn StateStore>,
    registry: Arc<AgentRegistry>,
    prefix: String,
    interval: Duration,
    liveness_ttl: Duration,
    flush_deadline: Duration,
    terminal: mpsc::UnboundedReceiver<Task>,
    pending: HashMap<TaskId, PendingWrite>,
    cancel: CancellationToken,
}

impl StateReplicator {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<AgentRegistry>,
        config: &OrchestratorConfig,
        terminal: mpsc::UnboundedReceiver<Task>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            registry,
            prefix: config.broadcast.store_channel_prefix.clone(),
            interval: config.store.replicate_interval(),
            liveness_ttl: config.scheduler.liveness_timeout(),
            flush_deadline: config.shutdown.drain_deadline(),
            terminal,
            pending: HashMap::new(),
            cancel,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(task) = self.terminal.recv() => self.write_task(&task).await,
                _ = ticker.tick() => {
                    self.retry_pending().await;
                    self.write_liveness().await;
                }
            }
        }

        self.terminal.close();
        let mut flushed = 0usize;
        while let Ok(task) = self.terminal.try_recv() {
            self.write_task(&task).await;
            flushed += 1;
        }
        self.flush_pending().await;
        self.write_liveness().await;
        info!(flushed, unreplicated = self.pending.len(), "State replicator stopped");
    }

    async fn write_task(&mut self, task: &Task) {
        let key = format!("{}:task:{}", self.prefix, task.id);
        let value = match serde_json::to_string(task) {
            Ok(v) => v,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Failed to serialize task for replication");
                return;
            }
        };

        for attempt in 0..WRITE_ATTEMPTS {
            match self.store.set(&key, &value, None).await {
                Ok(()) => {
                    debug!(task_id = %task.id, key = %key, "Terminal task status replicated");
                    self.pending.remove(&task.id);
                    return;
                }
                Err(e) if attempt + 1 < WRITE_ATTEMPTS => {
                    let delay = write_backoff(attempt);
                    warn!(task_id = %task.id, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %e, "Task replication failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(task_id = %task.id, key = %key, error = %e, "Task replication still failing, keeping it pending");
                }
            }
        }
        self.pending.insert(task.id, PendingWrite { key, value });
    }

    /// One pass over the pending records. Stops at the first rejection and
    /// leaves the rest for the next tick.
    async fn retry_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let ids: Vec<TaskId> = self.pending.keys().copied().collect();
        for id in ids {
            let Some(write) = self.pending.get(&id) else {
                continue;
            };
            match self.store.set(&write.key, &write.value, None).await {
                Ok(()) => {
                    debug!(task_id = %id, "Pending terminal task status replicated");
                    self.pending.remove(&id);
                }
                Err(e) => {
                    debug!(task_id = %id, pending = self.pending.len(), error = %e, "Store still rejecting terminal writes");
                    return;
                }
            }
        }
    }

    /// Retry pending records with backoff until the store takes them all or
    /// the flush deadline passes.
    async fn flush_pending(&mut self) {
        let deadline = Instant::now() + self.flush_deadline;
        let mut attempt = 0;
        loop {
            self.retry_pending().await;
            if self.pending.is_empty() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(write_backoff(attempt).min(deadline - now)).await;
            attempt += 1;
        }
        error!(
            pending = self.pending.len(),
            "Store unavailable at shutdown, terminal task statuses not replicated"
        );
    }

    async fn write_liveness(&self) {
        if let Err(e) = self.try_write_liveness().await {
            warn!(error = %e, "Agent liveness replication failed");
        }
    }

    async fn try_write_liveness(&self) -> CohortResult<()> {
        for agent in self.registry.snapshot() {
            if agent.state == AgentState::Offline {
                continue;
            }
            let record = LivenessRecord {
                department: agent.department.as_str(),
                state: agent.state,
                active_tasks: agent.active_task_ids.len(),
                capacity: agent.capacity,
                last_seen_at: agent.last_seen_at,
            };
            let key = format!("{}:agent:{}", self.prefix, agent.id);
            self.store
                .set(&key, &serde_json::to_string(&record)?, Some(self.liveness_ttl))
                .await?;
        }
        Ok(())
    }
}

fn write_backoff(attempt: u32) -> Duration {
    Duration::from_millis(
        WRITE_BACKOFF_BASE_MS
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(WRITE_BACKOFF_MAX_MS),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;
    use crate::types::{FailureReason, TaskStatus};
    use async_trait::async_trait;
    use cohort_core::{CohortError, Department};
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    /// Rejects the first `failures` writes.
    struct Flaky {
        inner: MemoryStateStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl StateStore for Flaky {
        async fn get(&self, key: &str) -> CohortResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CohortResult<()> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CohortError::Store("connection reset".into()));
            }
            self.inner.set(key, value, ttl).await
        }

        async fn publish(&self, channel: &str, message: &str) -> CohortResult<usize> {
            self.inner.publish(channel, message).await
        }
    }

    fn test_config(interval_ms: u64, liveness_ms: u64) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.broadcast.store_channel_prefix = "t".into();
        config.store.replicate_interval_ms = interval_ms;
        config.scheduler.liveness_timeout_ms = liveness_ms;
        config.shutdown.drain_deadline_ms = 10_000;
        config
    }

    fn flaky(failures: u32) -> Arc<Flaky> {
        Arc::new(Flaky {
            inner: MemoryStateStore::new(),
            failures: AtomicU32::new(failures),
        })
    }

    fn failed_task() -> Task {
        let mut task = Task::new(Some(Department::Growth), serde_json::Value::Null);
        task.status = TaskStatus::Failed {
            reason: FailureReason::RetriesExhausted,
        };
        task
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_write_retried_and_flushed_on_stop() {
        let store = flaky(2);
        let registry = Arc::new(AgentRegistry::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let replicator = StateReplicator::new(
            store.clone(),
            registry,
            &test_config(60_000, 15_000),
            rx,
            cancel.clone(),
        );

        let task = failed_task();
        tx.send(task.clone()).unwrap();
        cancel.cancel();
        replicator.run().await;

        let stored = store.inner.get(&format!("t:task:{}", task.id)).await.unwrap().unwrap();
        let back: Task = serde_json::from_str(&stored).unwrap();
        assert_eq!(back.status, task.status);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_longer_than_retry_budget_is_replicated_on_tick() {
        let store = flaky(WRITE_ATTEMPTS + 3);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let replicator = StateReplicator::new(
            store.clone(),
            Arc::new(AgentRegistry::new()),
            &test_config(1_000, 15_000),
            rx,
            cancel.clone(),
        );
        let handle = tokio::spawn(replicator.run());

        let task = failed_task();
        let key = format!("t:task:{}", task.id);
        tx.send(task).unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(store.inner.get(&key).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(store.inner.get(&key).await.unwrap().is_some());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_write_flushed_on_stop() {
        let store = flaky(WRITE_ATTEMPTS + 5);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let replicator = StateReplicator::new(
            store.clone(),
            Arc::new(AgentRegistry::new()),
            &test_config(60_000, 15_000),
            rx,
            cancel.clone(),
        );

        let task = failed_task();
        tx.send(task.clone()).unwrap();
        cancel.cancel();
        replicator.run().await;

        let stored = store.inner.get(&format!("t:task:{}", task.id)).await.unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_written_with_ttl() {
        let store = Arc::new(MemoryStateStore::new());
        let registry = Arc::new(AgentRegistry::new());
        let agent = Uuid::new_v4();
        registry.register(agent, Department::RnD, 2).unwrap();

        let (_tx, rx) = mpsc::unbounded_channel();
        let replicator = StateReplicator::new(
            store.clone(),
            registry,
            &test_config(1_000, 5_000),
            rx,
            CancellationToken::new(),
        );
        replicator.write_liveness().await;

        let key = format!("t:agent:{agent}");
        let record: serde_json::Value =
            serde_json::from_str(&store.get(&key).await.unwrap().unwrap()).unwrap();
        assert_eq!(record["department"], "rnd");
        assert_eq!(record["state"], "idle");

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get(&key).await.unwrap().is_none());
    }
}
