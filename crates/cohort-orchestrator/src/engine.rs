use crate::broadcast::{EventBroadcaster, Subscription, Topic};
use crate::bus::{BusStats, CommunicationBus, MessageHandler};
use crate::config::OrchestratorConfig;
use crate::metrics::{KpiScope, KpiSnapshot, MetricsAggregator, ThresholdRule};
use crate::registry::AgentRegistry;
use crate::replicator::StateReplicator;
use crate::scheduler::{Scheduler, SchedulerEvent};
use crate::state::EngineState;
use crate::store::StateStore;
use crate::types::{AgentSnapshot, Task, TaskCounts, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cohort_core::{
    AgentId, Alert, CohortError, CohortResult, Department, Endpoint, Message, MessageBody, TaskId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Point-in-time view of the whole engine.
///
/// Agents and tasks are read under the same locks, so no task shows up in
/// two states and no agent is counted twice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    pub taken_at: DateTime<Utc>,
    pub accepting: bool,
    pub agents: Vec<AgentSnapshot>,
    pub tasks: Vec<Task>,
    pub counts: TaskCounts,
    pub system: KpiSnapshot,
    pub departments: Vec<KpiSnapshot>,
    pub recent_alerts: Vec<Alert>,
    pub bus: BusStats,
    pub unmatched_responses: u64,
    pub broadcast_dropped: u64,
}

impl OrchestratorStatus {
    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

/// How `shutdown()` left the tasks that were not yet finished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// In flight at shutdown and completed before the drain deadline.
    pub drained: Vec<TaskId>,
    /// Still assigned at the deadline, failed with `ShutdownTimeout`.
    pub timed_out: Vec<TaskId>,
    /// Never dispatched, failed with `Cancelled`.
    pub cancelled: Vec<TaskId>,
}

/// The master orchestrator: agent registry, task table, scheduler loop,
/// communication bus, KPI aggregation and event broadcast behind one handle.
///
/// Must be started from within a tokio runtime.
pub struct Orchestrator {
    state: Arc<EngineState>,
    scheduler_cancel: CancellationToken,
    replicator_cancel: CancellationToken,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    replicator: Mutex<Option<JoinHandle<()>>>,
    report: Mutex<Option<ShutdownReport>>,
}

impl Orchestrator {
    /// Start an orchestrator without an external state store.
    pub async fn start(config: OrchestratorConfig) -> CohortResult<Self> {
        Self::launch(config, None)
    }

    /// Start an orchestrator that replicates to, and fans events out through, `store`.
    pub async fn start_with_store(
        config: OrchestratorConfig,
        store: Arc<dyn StateStore>,
    ) -> CohortResult<Self> {
        Self::launch(config, Some(store))
    }

    fn launch(config: OrchestratorConfig, store: Option<Arc<dyn StateStore>>) -> CohortResult<Self> {
        config.validate()?;

        let registry = Arc::new(AgentRegistry::new());
        let aggregator = MetricsAggregator::new(Arc::clone(&registry), config.metrics.clone());
        for rule in &config.metrics.thresholds {
            aggregator.register_threshold(rule.clone())?;
        }

        let broadcaster = match &store {
            Some(store) => EventBroadcaster::with_store(config.broadcast.clone(), Arc::clone(store)),
            None => EventBroadcaster::new(config.broadcast.clone()),
        };
        let bus = CommunicationBus::new(config.bus.clone());

        let (scheduler_tx, scheduler_rx) = mpsc::unbounded_channel();
        let replicator_cancel = CancellationToken::new();
        let (replication_tx, replicator) = match store {
            Some(store) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let replicator = StateReplicator::new(
                    store,
                    Arc::clone(&registry),
                    &config,
                    rx,
                    replicator_cancel.clone(),
                );
                (Some(tx), Some(replicator))
            }
            None => (None, None),
        };

        let state = Arc::new(EngineState::new(
            config,
            registry,
            aggregator,
            broadcaster,
            bus,
            scheduler_tx,
            replication_tx,
        ));

        state.bus.subscribe(
            Endpoint::Orchestrator,
            Arc::new(InboundRouter {
                state: Arc::downgrade(&state),
            }),
        );

        let scheduler_cancel = CancellationToken::new();
        let scheduler = tokio::spawn(
            Scheduler::new(Arc::clone(&state), scheduler_rx, scheduler_cancel.clone()).run(),
        );
        let replicator = replicator.map(|r| tokio::spawn(r.run()));

        info!(
            thresholds = state.aggregator.rule_count(),
            replication = replicator.is_some(),
            "Orchestrator started"
        );

        Ok(Self {
            state,
            scheduler_cancel,
            replicator_cancel,
            scheduler: Mutex::new(Some(scheduler)),
            replicator: Mutex::new(replicator),
            report: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.state.config
    }

    // --- agents ---

    /// Register a new agent under a fresh id.
    pub fn register_agent(&self, department: Department, capacity: u32) -> CohortResult<AgentId> {
        let id = Uuid::new_v4();
        self.register_agent_with_id(id, department, capacity)?;
        Ok(id)
    }

    /// Register an agent under a caller-chosen id.
    pub fn register_agent_with_id(
        &self,
        id: AgentId,
        department: Department,
        capacity: u32,
    ) -> CohortResult<AgentId> {
        self.state.registry.register(id, department, capacity)?;
        info!(agent_id = %id, department = %department, capacity, "Agent registered");
        self.state.wake();
        Ok(id)
    }

    /// Route task messages for `agent_id` to `handler`.
    pub fn attach_agent(&self, agent_id: AgentId, handler: Arc<dyn MessageHandler>) -> CohortResult<()> {
        if !self.state.registry.contains(agent_id) {
            return Err(CohortError::UnknownAgent(agent_id));
        }
        self.state.bus.subscribe(Endpoint::Agent(agent_id), handler);
        Ok(())
    }

    /// Refresh an agent's liveness without a message.
    pub fn heartbeat(&self, agent_id: AgentId) -> CohortResult<()> {
        self.state.touch_agent(agent_id)
    }

    // --- tasks ---

    /// Admit a task as Queued. Never waits for an agent.
    pub fn enqueue_task(
        &self,
        department_hint: Option<Department>,
        payload: serde_json::Value,
    ) -> CohortResult<TaskId> {
        self.enqueue_task_with_id(Uuid::new_v4(), department_hint, payload)
    }

    /// Admit a task under a caller-supplied id. Enqueuing an id that is
    /// already known leaves the existing task alone and returns its id.
    pub fn enqueue_task_with_id(
        &self,
        id: TaskId,
        department_hint: Option<Department>,
        payload: serde_json::Value,
    ) -> CohortResult<TaskId> {
        if !self.state.is_accepting() {
            return Err(CohortError::ShuttingDown);
        }
        let admitted = self
            .state
            .tasks
            .lock()
            .add(Task::with_id(id, department_hint, payload));
        if admitted {
            debug!(task_id = %id, department_hint = ?department_hint, "Task enqueued");
            self.state.wake();
        } else {
            debug!(task_id = %id, "Task already known, enqueue ignored");
        }
        Ok(id)
    }

    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.state.tasks.lock().get(id).cloned()
    }

    // --- metrics ---

    /// Add an alert rule. Malformed rules fail with `AlertThresholdError`.
    pub fn register_threshold(&self, rule: ThresholdRule) -> CohortResult<()> {
        self.state.aggregator.register_threshold(rule)
    }

    /// Record a metric sample on behalf of `agent_id` without going through the bus.
    pub fn record_metric(&self, agent_id: AgentId, metric: &str, value: f64) -> CohortResult<()> {
        self.state.ingest_metric(agent_id, metric, value)
    }

    pub fn rollup(&self, scope: KpiScope) -> KpiSnapshot {
        self.state.aggregator.rollup(scope)
    }

    // --- observation ---

    pub fn status(&self) -> OrchestratorStatus {
        let now = Instant::now();
        let (agents, tasks, counts) = {
            let tasks = self.state.tasks.lock();
            let agents = self.state.registry.read();
            (
                agents.snapshot(now),
                tasks.all_tasks().into_iter().cloned().collect(),
                tasks.counts(),
            )
        };
        let (system, departments) = self.state.aggregator.snapshot_all();

        OrchestratorStatus {
            taken_at: Utc::now(),
            accepting: self.state.is_accepting(),
            agents,
            tasks,
            counts,
            system,
            departments,
            recent_alerts: self.state.recent_alerts(),
            bus: self.state.bus.stats(),
            unmatched_responses: self.state.unmatched_count(),
            broadcast_dropped: self.state.broadcaster.dropped_count(),
        }
    }

    /// Subscribe to engine events. An empty slice subscribes to every topic.
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        self.state.broadcaster.subscribe(topics)
    }

    pub fn unsubscribe(&self, subscription_id: Uuid) -> bool {
        self.state.broadcaster.unsubscribe(subscription_id)
    }

    /// The bus agents use to talk back to the orchestrator.
    pub fn bus(&self) -> &CommunicationBus {
        &self.state.bus
    }

    // --- shutdown ---

    /// Stop admitting tasks, let in-flight ones drain until the configured
    /// deadline, then fail whatever is left and stop every background task.
    ///
    /// Calling it again returns the first call's report.
    pub async fn shutdown(&self) -> ShutdownReport {
        if !self.state.stop_accepting() {
            return self.report.lock().clone().unwrap_or_default();
        }

        let in_flight = self.state.tasks.lock().with_status(TaskStatus::Assigned);
        let drain = self.state.config.shutdown.drain_deadline();
        info!(
            in_flight = in_flight.len(),
            drain_deadline_ms = drain.as_millis() as u64,
            "Shutdown requested, draining"
        );

        let deadline = Instant::now() + drain;
        let poll = self.state.config.scheduler.pass_interval();
        loop {
            if self.state.tasks.lock().assigned_count() == 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }

        let (timed_out, cancelled) = self.state.force_fail_remaining();
        let drained = {
            let tasks = self.state.tasks.lock();
            in_flight
                .into_iter()
                .filter(|id| tasks.get(*id).is_some_and(|t| t.status == TaskStatus::Completed))
                .collect()
        };

        self.scheduler_cancel.cancel();
        let scheduler = self.scheduler.lock().take();
        if let Some(handle) = scheduler {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }

        self.state.bus.shutdown().await;
        self.state.watchers.close();
        self.state.watchers.wait().await;
        self.state.broadcaster.shutdown().await;

        self.replicator_cancel.cancel();
        let replicator = self.replicator.lock().take();
        if let Some(handle) = replicator {
            if let Err(e) = handle.await {
                warn!(error = %e, "State replicator ended abnormally");
            }
        }

        let report = ShutdownReport {
            drained,
            timed_out,
            cancelled,
        };
        info!(
            drained = report.drained.len(),
            timed_out = report.timed_out.len(),
            cancelled = report.cancelled.len(),
            "Orchestrator stopped"
        );
        *self.report.lock() = Some(report.clone());
        report
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.scheduler_cancel.cancel();
        self.replicator_cancel.cancel();
    }
}

/// Bus handler for everything addressed to the orchestrator.
struct InboundRouter {
    state: Weak<EngineState>,
}

#[async_trait]
impl MessageHandler for InboundRouter {
    async fn deliver(&self, message: Message) -> CohortResult<()> {
        let Some(state) = self.state.upgrade() else {
            return Err(CohortError::ShuttingDown);
        };
        let Some(agent_id) = message.sender.agent_id() else {
            warn!(message_id = %message.id, "Orchestrator received a message from itself, ignored");
            return Ok(());
        };

        // Every inbound message counts as a heartbeat. Unknown senders are refused.
        state.touch_agent(agent_id)?;

        match message.body {
            MessageBody::Response { outcome } => match message.correlation_id {
                Some(task_id) => state.notify(SchedulerEvent::Response {
                    agent_id,
                    task_id,
                    outcome,
                }),
                None => state.note_unmatched(message.id, agent_id),
            },
            MessageBody::Metric { name, value } => state.ingest_metric(agent_id, &name, value)?,
            MessageBody::Alert { alert } => state.raise(alert),
            MessageBody::Task { .. } => {
                warn!(agent_id = %agent_id, message_id = %message.id, "Agents cannot submit tasks over the bus, dropped");
            }
        }
        Ok(())
    }
}
