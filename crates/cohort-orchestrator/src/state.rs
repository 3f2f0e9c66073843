use crate::broadcast::{EngineEvent, EventBroadcaster};
use crate::bus::{CommunicationBus, DeliveryReceipt, DeliveryStatus};
use crate::config::OrchestratorConfig;
use crate::metrics::{KpiScope, MetricsAggregator};
use crate::registry::{AgentRegistry, StateChange};
use crate::scheduler::SchedulerEvent;
use crate::task_queue::TaskTable;
use crate::types::{AgentState, FailureReason, Task, TaskStatus};
use cohort_core::{
    AgentId, Alert, AlertSource, AlertState, CohortError, CohortResult, Message, Severity, TaskId,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

const RECENT_ALERT_CAPACITY: usize = 200;

/// A side effect decided while holding the task/registry locks and carried
/// out after they are released.
pub(crate) enum Effect {
    Event(EngineEvent),
    Alert(Alert),
    AgentChanged(StateChange),
    Replicate(Task),
    Dispatch {
        agent_id: AgentId,
        task_id: TaskId,
        message: Message,
    },
}

#[derive(Default)]
pub(crate) struct Outbox {
    effects: Vec<Effect>,
}

impl Outbox {
    pub fn event(&mut self, event: EngineEvent) {
        self.effects.push(Effect::Event(event));
    }

    pub fn agent_changed(&mut self, change: Option<StateChange>) {
        if let Some(change) = change {
            self.effects.push(Effect::AgentChanged(change));
        }
    }

    pub fn dispatch(&mut self, agent_id: AgentId, task_id: TaskId, message: Message) {
        self.effects.push(Effect::Dispatch {
            agent_id,
            task_id,
            message,
        });
    }

    pub fn task_completed(&mut self, task: &Task, agent_id: AgentId) {
        self.event(EngineEvent::TaskCompleted {
            task_id: task.id,
            agent_id,
        });
        self.effects.push(Effect::Replicate(task.clone()));
    }

    pub fn task_failed(&mut self, task: &Task, reason: FailureReason) {
        self.event(EngineEvent::TaskFailed {
            task_id: task.id,
            reason,
            attempts: task.attempt_count,
        });
        if reason == FailureReason::RetriesExhausted {
            let err = CohortError::RetriesExhausted {
                task_id: task.id,
                attempts: task.attempt_count,
            };
            self.effects.push(Effect::Alert(Alert::new(
                AlertState::Raised,
                Severity::Critical,
                AlertSource::Task {
                    task_id: task.id,
                    reason: reason.to_string(),
                },
                err.to_string(),
            )));
        }
        self.effects.push(Effect::Replicate(task.clone()));
    }
}

/// Everything the orchestrator, its scheduler loop and its inbound router share.
///
/// Lock order: `tasks` before the registry. The aggregator lock is never
/// held together with either.
pub(crate) struct EngineState {
    pub config: OrchestratorConfig,
    pub registry: Arc<AgentRegistry>,
    pub tasks: Mutex<TaskTable>,
    pub aggregator: MetricsAggregator,
    pub broadcaster: EventBroadcaster,
    pub bus: CommunicationBus,
    pub watchers: TaskTracker,
    accepting: AtomicBool,
    alerts: Mutex<VecDeque<Alert>>,
    unmatched: AtomicU64,
    scheduler_tx: mpsc::UnboundedSender<SchedulerEvent>,
    replication: Option<mpsc::UnboundedSender<Task>>,
}

impl EngineState {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<AgentRegistry>,
        aggregator: MetricsAggregator,
        broadcaster: EventBroadcaster,
        bus: CommunicationBus,
        scheduler_tx: mpsc::UnboundedSender<SchedulerEvent>,
        replication: Option<mpsc::UnboundedSender<Task>>,
    ) -> Self {
        Self {
            config,
            registry,
            tasks: Mutex::new(TaskTable::new()),
            aggregator,
            broadcaster,
            bus,
            watchers: TaskTracker::new(),
            accepting: AtomicBool::new(true),
            alerts: Mutex::new(VecDeque::with_capacity(RECENT_ALERT_CAPACITY)),
            unmatched: AtomicU64::new(0),
            scheduler_tx,
            replication,
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Returns `true` only for the call that actually stopped admission.
    pub fn stop_accepting(&self) -> bool {
        self.accepting.swap(false, Ordering::SeqCst)
    }

    pub fn notify(&self, event: SchedulerEvent) {
        let _ = self.scheduler_tx.send(event);
    }

    pub fn wake(&self) {
        self.notify(SchedulerEvent::Wake);
    }

    pub fn emit(&self, event: EngineEvent) {
        self.broadcaster.publish(event);
    }

    /// Record an alert in the recent log and publish it.
    pub fn raise(&self, alert: Alert) {
        match alert.state {
            AlertState::Raised => warn!(
                alert_id = %alert.id,
                severity = %alert.severity,
                message = %alert.message,
                "Alert raised"
            ),
            AlertState::Resolved => info!(
                alert_id = %alert.id,
                message = %alert.message,
                "Alert resolved"
            ),
        }
        {
            let mut alerts = self.alerts.lock();
            if alerts.len() >= RECENT_ALERT_CAPACITY {
                alerts.pop_front();
            }
            alerts.push_back(alert.clone());
        }
        self.emit(EngineEvent::Alert { alert });
    }

    pub fn recent_alerts(&self) -> Vec<Alert> {
        self.alerts.lock().iter().cloned().collect()
    }

    pub fn replicate(&self, task: Task) {
        if let Some(tx) = &self.replication {
            if tx.send(task).is_err() {
                debug!("State replicator stopped, terminal status not replicated");
            }
        }
    }

    /// Publish a liveness/health transition, alerting on Offline and on recovery from it.
    pub fn agent_changed(&self, change: StateChange) {
        debug!(
            agent_id = %change.agent_id,
            from = %change.from,
            to = %change.to,
            "Agent state changed"
        );
        self.emit(EngineEvent::AgentStateChanged {
            agent_id: change.agent_id,
            department: change.department,
            from: change.from,
            to: change.to,
        });

        let source = AlertSource::Agent {
            agent_id: change.agent_id,
        };
        if change.to == AgentState::Offline {
            self.raise(Alert::new(
                AlertState::Raised,
                Severity::Warning,
                source,
                format!(
                    "{} agent {} stopped heartbeating",
                    change.department, change.agent_id
                ),
            ));
        } else if change.from == AgentState::Offline {
            self.raise(Alert::new(
                AlertState::Resolved,
                Severity::Info,
                source,
                format!("{} agent {} is back", change.department, change.agent_id),
            ));
        }
    }

    /// Record an inbound sign of life from `agent_id`.
    pub fn touch_agent(&self, agent_id: AgentId) -> CohortResult<()> {
        if let Some(change) = self.registry.touch(agent_id)? {
            self.agent_changed(change);
            self.wake();
        }
        Ok(())
    }

    /// Feed a metric sample to the aggregator and publish what it produced.
    pub fn ingest_metric(&self, agent_id: AgentId, metric: &str, value: f64) -> CohortResult<()> {
        let Some(outcome) = self.aggregator.record(agent_id, metric, value)? else {
            return Ok(());
        };
        self.emit(EngineEvent::KpiUpdated {
            scope: KpiScope::Department(outcome.department),
            metric: metric.to_string(),
            summary: outcome.department_summary,
        });
        self.emit(EngineEvent::KpiUpdated {
            scope: KpiScope::System,
            metric: metric.to_string(),
            summary: outcome.system_summary,
        });
        for alert in outcome.alerts {
            self.raise(alert);
        }
        Ok(())
    }

    pub fn note_unmatched(&self, correlation_id: Uuid, agent_id: AgentId) {
        self.unmatched.fetch_add(1, Ordering::Relaxed);
        let err = CohortError::UnmatchedResponse { correlation_id };
        warn!(agent_id = %agent_id, error = %err, "Dropping response");
    }

    pub fn unmatched_count(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    /// Carry out effects collected under the locks, in order.
    pub fn flush(&self, outbox: Outbox) {
        for effect in outbox.effects {
            match effect {
                Effect::Event(event) => self.emit(event),
                Effect::Alert(alert) => self.raise(alert),
                Effect::AgentChanged(change) => self.agent_changed(change),
                Effect::Replicate(task) => self.replicate(task),
                Effect::Dispatch {
                    agent_id,
                    task_id,
                    message,
                } => self.dispatch(agent_id, task_id, message),
            }
        }
    }

    /// Hand a task message to the bus and report a failed delivery back to the scheduler.
    fn dispatch(&self, agent_id: AgentId, task_id: TaskId, message: Message) {
        let receipt = self.bus.dispatch(message);
        let tx = self.scheduler_tx.clone();
        self.watchers.spawn(async move {
            if let Some(event) = delivery_failure(agent_id, task_id, receipt.await) {
                let _ = tx.send(event);
            }
        });
    }

    /// Fail whatever is left at the end of the shutdown drain.
    ///
    /// Assigned tasks fail with `ShutdownTimeout`, queued ones with `Cancelled`.
    pub fn force_fail_remaining(&self) -> (Vec<TaskId>, Vec<TaskId>) {
        let mut outbox = Outbox::default();
        let (timed_out, cancelled) = {
            let mut tasks = self.tasks.lock();
            let mut agents = self.registry.write();

            let timed_out = tasks.with_status(TaskStatus::Assigned);
            for id in &timed_out {
                if let Some(agent_id) = tasks.get(*id).and_then(|t| t.assigned_agent) {
                    outbox.agent_changed(agents.release(agent_id, *id));
                }
                tasks.mark_failed(*id, FailureReason::ShutdownTimeout);
                if let Some(task) = tasks.get(*id) {
                    warn!(
                        task_id = %id,
                        error = %CohortError::ShutdownTimeout { task_id: *id },
                        "Force-failing in-flight task"
                    );
                    outbox.task_failed(task, FailureReason::ShutdownTimeout);
                }
            }

            let cancelled = tasks.with_status(TaskStatus::Queued);
            for id in &cancelled {
                tasks.mark_failed(*id, FailureReason::Cancelled);
                if let Some(task) = tasks.get(*id) {
                    outbox.task_failed(task, FailureReason::Cancelled);
                }
            }
            (timed_out, cancelled)
        };
        self.flush(outbox);
        (timed_out, cancelled)
    }
}

/// The scheduler event for a settled task dispatch, if it did not arrive.
/// A receipt the bus dropped without answering counts as a failed delivery.
fn delivery_failure(
    agent_id: AgentId,
    task_id: TaskId,
    receipt: Result<DeliveryReceipt, oneshot::error::RecvError>,
) -> Option<SchedulerEvent> {
    let (attempts, reason) = match receipt {
        Ok(receipt) => match receipt.status {
            DeliveryStatus::Delivered => return None,
            DeliveryStatus::Failed { reason } => (receipt.attempts, reason),
        },
        Err(_) => (0, "bus dropped the message".to_string()),
    };
    Some(SchedulerEvent::DeliveryFailed {
        agent_id,
        task_id,
        attempts,
        reason,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use cohort_core::Endpoint;

    #[tokio::test]
    async fn test_dropped_receipt_reported_as_delivery_failure() {
        let (agent, task) = (Uuid::new_v4(), Uuid::new_v4());
        let (reply, rx) = oneshot::channel::<DeliveryReceipt>();
        drop(reply);

        match delivery_failure(agent, task, rx.await) {
            Some(SchedulerEvent::DeliveryFailed {
                agent_id,
                task_id,
                attempts,
                reason,
            }) => {
                assert_eq!((agent_id, task_id, attempts), (agent, task, 0));
                assert_eq!(reason, "bus dropped the message");
            }
            other => panic!("expected delivery failure, got {other:?}"),
        }
    }

    #[test]
    fn test_delivered_receipt_needs_no_event() {
        let receipt = DeliveryReceipt {
            message_id: Uuid::new_v4(),
            recipient: Endpoint::Orchestrator,
            attempts: 1,
            status: DeliveryStatus::Delivered,
        };
        assert!(delivery_failure(Uuid::new_v4(), Uuid::new_v4(), Ok(receipt)).is_none());
    }
}
