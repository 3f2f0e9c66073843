//! The assignment loop.
//!
//! A single task owns every write to task status and agent assignment. It
//! wakes on a fixed interval or when something relevant happens (a task is
//! enqueued, a response arrives, an agent comes back), handles the pending
//! events, then runs one pass:
//!
//! 1. liveness sweep: silent agents go Offline and their tasks are released;
//! 2. deadline sweep: agents that missed a response deadline are marked
//!    Degraded and the task is released;
//! 3. assignment: queued tasks, in dispatch order, go to the best eligible agent.
//!
//! A released task is requeued while it has attempts left and fails with
//! `RetriesExhausted` otherwise.

use crate::broadcast::EngineEvent;
use crate::registry::AgentTable;
use crate::state::{EngineState, Outbox};
use crate::task_queue::TaskTable;
use crate::types::{FailureReason, TaskStatus};
use cohort_core::{AgentId, Message, TaskId, TaskOutcome};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Input to the scheduler loop.
#[derive(Debug)]
pub(crate) enum SchedulerEvent {
    /// An agent answered a task.
    Response {
        agent_id: AgentId,
        task_id: TaskId,
        outcome: TaskOutcome,
    },
    /// The bus gave up delivering a task message.
    DeliveryFailed {
        agent_id: AgentId,
        task_id: TaskId,
        attempts: u32,
        reason: String,
    },
    /// Something changed; run a pass now instead of at the next tick.
    Wake,
}

pub(crate) struct Scheduler {
    state: Arc<EngineState>,
    events: mpsc::UnboundedReceiver<SchedulerEvent>,
    cancel: CancellationToken,
    rotation: usize,
}

impl Scheduler {
    pub fn new(
        state: Arc<EngineState>,
        events: mpsc::UnboundedReceiver<SchedulerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state,
            events,
            cancel,
            rotation: 0,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.state.config.scheduler.pass_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            pass_interval_ms = self.state.config.scheduler.pass_interval_ms,
            "Scheduler loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(event) = self.events.recv() => {
                    self.handle(event);
                    while let Ok(event) = self.events.try_recv() {
                        self.handle(event);
                    }
                }
                _ = ticker.tick() => {}
            }
            self.run_pass(Instant::now());
        }
        info!("Scheduler loop stopped");
    }

    fn handle(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Response {
                agent_id,
                task_id,
                outcome,
            } => self.on_response(agent_id, task_id, outcome),
            SchedulerEvent::DeliveryFailed {
                agent_id,
                task_id,
                attempts,
                reason,
            } => self.on_delivery_failed(agent_id, task_id, attempts, &reason),
            SchedulerEvent::Wake => {}
        }
    }

    /// One scheduling pass. Nothing moves once the engine stops accepting work:
    /// in-flight tasks either answer or time out at the drain deadline.
    pub fn run_pass(&mut self, now: Instant) {
        if !self.state.is_accepting() {
            return;
        }
        let sched = &self.state.config.scheduler;
        let mut outbox = Outbox::default();
        {
            let mut tasks = self.state.tasks.lock();
            let mut agents = self.state.registry.write();

            for change in agents.sweep(now, sched.liveness_timeout()) {
                let held = tasks.assigned_to(change.agent_id);
                warn!(
                    agent_id = %change.agent_id,
                    department = %change.department,
                    held_tasks = held.len(),
                    "Agent missed liveness timeout, marking offline"
                );
                outbox.agent_changed(Some(change));
                for task_id in held {
                    release_task(
                        &mut tasks,
                        &mut agents,
                        task_id,
                        change.agent_id,
                        sched.max_attempts,
                        &mut outbox,
                    );
                }
            }

            for (task_id, agent_id) in tasks.expired(now) {
                warn!(task_id = %task_id, agent_id = %agent_id, "Response deadline missed");
                outbox.agent_changed(agents.mark_degraded(agent_id));
                release_task(
                    &mut tasks,
                    &mut agents,
                    task_id,
                    agent_id,
                    sched.max_attempts,
                    &mut outbox,
                );
            }

            let order = tasks.dispatch_order(self.rotation);
            self.rotation = self.rotation.wrapping_add(1);
            let deadline = now + sched.response_deadline();
            for task_id in order {
                assign_task(&mut tasks, &mut agents, task_id, deadline, &mut outbox);
            }
        }
        self.state.flush(outbox);
    }

    fn on_response(&mut self, agent_id: AgentId, task_id: TaskId, outcome: TaskOutcome) {
        let max_attempts = self.state.config.scheduler.max_attempts;
        let mut outbox = Outbox::default();
        let matched = {
            let mut tasks = self.state.tasks.lock();
            let mut agents = self.state.registry.write();

            match tasks.get(task_id).map(|t| (t.status, t.assigned_agent)) {
                None => false,
                Some((status, _)) if status.is_terminal() => {
                    debug!(task_id = %task_id, agent_id = %agent_id, "Duplicate response for finished task ignored");
                    true
                }
                Some((TaskStatus::Assigned, Some(holder))) if holder == agent_id => {
                    match outcome {
                        TaskOutcome::Success { output } => {
                            outbox.agent_changed(agents.release(agent_id, task_id));
                            tasks.mark_completed(task_id, output);
                            if let Some(task) = tasks.get(task_id) {
                                info!(
                                    task_id = %task_id,
                                    agent_id = %agent_id,
                                    attempt = task.attempt_count,
                                    "Task completed"
                                );
                                outbox.task_completed(task, agent_id);
                            }
                        }
                        TaskOutcome::Failure { error } => {
                            warn!(task_id = %task_id, agent_id = %agent_id, error = %error, "Agent reported task failure");
                            release_task(
                                &mut tasks,
                                &mut agents,
                                task_id,
                                agent_id,
                                max_attempts,
                                &mut outbox,
                            );
                        }
                    }
                    true
                }
                Some(_) => false,
            }
        };

        if !matched {
            self.state.note_unmatched(task_id, agent_id);
        }
        self.state.flush(outbox);
    }

    fn on_delivery_failed(&mut self, agent_id: AgentId, task_id: TaskId, attempts: u32, reason: &str) {
        let max_attempts = self.state.config.scheduler.max_attempts;
        let mut outbox = Outbox::default();
        {
            let mut tasks = self.state.tasks.lock();
            let still_held = tasks
                .get(task_id)
                .is_some_and(|t| t.status == TaskStatus::Assigned && t.assigned_agent == Some(agent_id));
            if !still_held {
                debug!(task_id = %task_id, agent_id = %agent_id, "Delivery failure for a task no longer held, ignored");
                return;
            }
            warn!(
                task_id = %task_id,
                agent_id = %agent_id,
                attempts,
                reason,
                "Task message could not be delivered"
            );
            let mut agents = self.state.registry.write();
            outbox.agent_changed(agents.mark_degraded(agent_id));
            release_task(&mut tasks, &mut agents, task_id, agent_id, max_attempts, &mut outbox);
        }
        self.state.flush(outbox);
    }
}

/// Give `agent_id` the queued task `task_id` if an agent is eligible.
fn assign_task(
    tasks: &mut TaskTable,
    agents: &mut AgentTable,
    task_id: TaskId,
    deadline: Instant,
    outbox: &mut Outbox,
) {
    let Some(task) = tasks.get(task_id) else {
        return;
    };
    let Some(agent_id) = agents.select(task.department_hint, task.last_agent) else {
        return;
    };
    if !tasks.mark_assigned(task_id, agent_id, deadline) {
        return;
    }
    outbox.agent_changed(agents.assign(agent_id, task_id));

    let Some(task) = tasks.get(task_id) else {
        return;
    };
    info!(
        task_id = %task_id,
        agent_id = %agent_id,
        attempt = task.attempt_count,
        "Task assigned"
    );
    outbox.event(EngineEvent::TaskAssigned {
        task_id,
        agent_id,
        attempt: task.attempt_count,
    });
    outbox.dispatch(
        agent_id,
        task_id,
        Message::task(agent_id, task_id, task.payload.clone()),
    );
}

/// Take `task_id` away from `agent_id`: requeue it, or fail it once the
/// attempt budget is spent.
pub(crate) fn release_task(
    tasks: &mut TaskTable,
    agents: &mut AgentTable,
    task_id: TaskId,
    agent_id: AgentId,
    max_attempts: u32,
    outbox: &mut Outbox,
) {
    outbox.agent_changed(agents.release(agent_id, task_id));
    let Some(attempts) = tasks.get(task_id).map(|t| t.attempt_count) else {
        return;
    };

    if attempts >= max_attempts {
        tasks.mark_failed(task_id, FailureReason::RetriesExhausted);
        if let Some(task) = tasks.get(task_id) {
            warn!(task_id = %task_id, attempts, "Task failed, retries exhausted");
            outbox.task_failed(task, FailureReason::RetriesExhausted);
        }
    } else if tasks.requeue(task_id) {
        info!(task_id = %task_id, from_agent = %agent_id, attempts, "Task released for reassignment");
    }
}
