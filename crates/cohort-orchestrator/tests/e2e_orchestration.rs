#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use cohort_core::*;
use cohort_orchestrator::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// How a mock agent reacts to a task.
#[derive(Clone, Copy)]
enum Mode {
    /// Acknowledge and never answer; the test answers by hand.
    Manual,
    /// Answer with success after the delay.
    Succeed(Duration),
    /// Answer with a failure right away.
    Fail,
}

struct MockAgent {
    id: AgentId,
    bus: CommunicationBus,
    mode: Mode,
    received: Mutex<Vec<TaskId>>,
}

impl MockAgent {
    fn attach(orch: &Orchestrator, id: AgentId, mode: Mode) -> Arc<Self> {
        let agent = Arc::new(Self {
            id,
            bus: orch.bus().clone(),
            mode,
            received: Mutex::new(Vec::new()),
        });
        orch.attach_agent(id, agent.clone()).unwrap();
        agent
    }

    fn received(&self) -> Vec<TaskId> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl MessageHandler for MockAgent {
    async fn deliver(&self, message: Message) -> CohortResult<()> {
        let Some(task_id) = message.correlation_id else {
            return Ok(());
        };
        self.received.lock().push(task_id);

        let outcome = match self.mode {
            Mode::Manual => return Ok(()),
            Mode::Succeed(delay) => {
                let bus = self.bus.clone();
                let id = self.id;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let outcome = TaskOutcome::Success {
                        output: serde_json::json!({"done_by": id}),
                    };
                    bus.send(Message::response(id, task_id, outcome)).await;
                });
                return Ok(());
            }
            Mode::Fail => TaskOutcome::Failure {
                error: "model refused".into(),
            },
        };
        let bus = self.bus.clone();
        let id = self.id;
        tokio::spawn(async move {
            bus.send(Message::response(id, task_id, outcome)).await;
        });
        Ok(())
    }
}

fn config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.scheduler.pass_interval_ms = 10;
    config.bus.ack_timeout_ms = 100;
    config.bus.backoff_base_ms = 10;
    config.bus.backoff_max_ms = 40;
    config.bus.jitter_ms = 5;
    config.bus.max_attempts = 2;
    config.shutdown.drain_deadline_ms = 500;
    config
}

async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

async fn respond(orch: &Orchestrator, agent: AgentId, task: TaskId) {
    let outcome = TaskOutcome::Success {
        output: serde_json::json!("ok"),
    };
    let receipt = orch.bus().send(Message::response(agent, task, outcome)).await;
    assert!(receipt.is_delivered());
}

fn drain(sub: &mut Subscription) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Some(envelope) = sub.try_recv() {
        events.push(envelope.event);
    }
    events
}

// ---------------------------------------------------------------------------
// 1. Capacity-bound assignment and reassignment after a response
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn queued_task_is_assigned_once_an_agent_frees_up() {
    let orch = Orchestrator::start(config()).await.unwrap();
    let a = orch.register_agent(Department::Growth, 1).unwrap();
    let b = orch.register_agent(Department::Growth, 1).unwrap();
    MockAgent::attach(&orch, a, Mode::Manual);
    MockAgent::attach(&orch, b, Mode::Manual);

    let ids: Vec<TaskId> = (0..3)
        .map(|n| {
            orch.enqueue_task(Some(Department::Growth), serde_json::json!({"n": n}))
                .unwrap()
        })
        .collect();
    settle(50).await;

    let status = orch.status();
    assert_eq!(status.counts.assigned, 2);
    assert_eq!(status.counts.queued, 1);
    // FIFO: the last task is the one still waiting.
    assert_eq!(status.task(ids[2]).unwrap().status, TaskStatus::Queued);

    let first = status.task(ids[0]).unwrap();
    let holder = first.assigned_agent.unwrap();
    respond(&orch, holder, ids[0]).await;
    settle(30).await;

    let status = orch.status();
    assert_eq!(status.task(ids[0]).unwrap().status, TaskStatus::Completed);
    let waiting = status.task(ids[2]).unwrap();
    assert_eq!(waiting.status, TaskStatus::Assigned);
    assert_eq!(waiting.assigned_agent, Some(holder));
    assert_eq!(status.counts.queued, 0);

    // Mutual exclusion: every assigned task sits on exactly one agent.
    for task in status.tasks.iter().filter(|t| t.status == TaskStatus::Assigned) {
        let holders = status
            .agents
            .iter()
            .filter(|ag| ag.active_task_ids.contains(&task.id))
            .count();
        assert_eq!(holders, 1);
    }
    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// 2. Offline agent: task moves to a different agent
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn offline_agent_task_is_reassigned() {
    let mut cfg = config();
    cfg.scheduler.liveness_timeout_ms = 1_000;
    cfg.scheduler.response_deadline_ms = 60_000;
    let orch = Orchestrator::start(cfg).await.unwrap();
    let a = orch.register_agent(Department::Growth, 1).unwrap();
    let b = orch.register_agent(Department::Growth, 1).unwrap();
    MockAgent::attach(&orch, a, Mode::Manual);
    MockAgent::attach(&orch, b, Mode::Manual);

    let task_id = orch
        .enqueue_task(Some(Department::Growth), serde_json::Value::Null)
        .unwrap();
    settle(20).await;
    let first = orch.task(task_id).unwrap();
    assert_eq!(first.attempt_count, 1);
    let holder = first.assigned_agent.unwrap();
    let other = if holder == a { b } else { a };

    // Only the other agent keeps heartbeating.
    for _ in 0..15 {
        settle(100).await;
        orch.heartbeat(other).unwrap();
    }

    let status = orch.status();
    let task = status.task(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(task.assigned_agent, Some(other));
    assert_eq!(task.attempt_count, 2);

    let silent = status.agents.iter().find(|ag| ag.id == holder).unwrap();
    assert_eq!(silent.state, AgentState::Offline);
    assert!(silent.active_task_ids.is_empty());

    assert!(status.recent_alerts.iter().any(|alert| alert.is_raised()
        && alert.severity == Severity::Warning
        && alert.source == AlertSource::Agent { agent_id: holder }));

    // Hearing from it again brings it back and resolves the alert.
    orch.heartbeat(holder).unwrap();
    let status = orch.status();
    let back = status.agents.iter().find(|ag| ag.id == holder).unwrap();
    assert_eq!(back.state, AgentState::Idle);
    assert!(status
        .recent_alerts
        .iter()
        .any(|alert| alert.state == AlertState::Resolved));
    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// 3. Retry ceiling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn missed_deadlines_exhaust_retries_and_alert() {
    let mut cfg = config();
    cfg.scheduler.response_deadline_ms = 100;
    cfg.scheduler.max_attempts = 3;
    let orch = Orchestrator::start(cfg).await.unwrap();
    let mut alerts = orch.subscribe(&[Topic::Alerts]);
    let a = orch.register_agent(Department::Backend, 1).unwrap();
    let b = orch.register_agent(Department::Backend, 1).unwrap();
    MockAgent::attach(&orch, a, Mode::Manual);
    MockAgent::attach(&orch, b, Mode::Manual);

    let task_id = orch
        .enqueue_task(Some(Department::Backend), serde_json::Value::Null)
        .unwrap();

    // Heartbeats clear Degraded so the task keeps finding an agent.
    for _ in 0..20 {
        settle(50).await;
        orch.heartbeat(a).unwrap();
        orch.heartbeat(b).unwrap();
    }

    let task = orch.task(task_id).unwrap();
    assert_eq!(
        task.status,
        TaskStatus::Failed {
            reason: FailureReason::RetriesExhausted
        }
    );
    assert_eq!(task.attempt_count, 3);

    let critical: Vec<Alert> = drain(&mut alerts)
        .into_iter()
        .filter_map(|event| match event {
            EngineEvent::Alert { alert } if alert.severity == Severity::Critical => Some(alert),
            _ => None,
        })
        .collect();
    assert_eq!(critical.len(), 1);
    assert!(matches!(
        &critical[0].source,
        AlertSource::Task { task_id: id, .. } if *id == task_id
    ));
    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reported_failures_alternate_agents_until_exhausted() {
    let orch = Orchestrator::start(config()).await.unwrap();
    let a = orch.register_agent(Department::Frontend, 1).unwrap();
    let b = orch.register_agent(Department::Frontend, 1).unwrap();
    let agent_a = MockAgent::attach(&orch, a, Mode::Fail);
    let agent_b = MockAgent::attach(&orch, b, Mode::Fail);

    let task_id = orch
        .enqueue_task(Some(Department::Frontend), serde_json::Value::Null)
        .unwrap();
    settle(200).await;

    let task = orch.task(task_id).unwrap();
    assert_eq!(
        task.status,
        TaskStatus::Failed {
            reason: FailureReason::RetriesExhausted
        }
    );
    // Never the same agent twice in a row.
    let (first, second) = (agent_a.received(), agent_b.received());
    assert_eq!(first.len() + second.len(), 3);
    assert!(first.len() == 2 || second.len() == 2);
    assert!(!first.is_empty() && !second.is_empty());

    // A reported failure does not degrade the agent.
    let status = orch.status();
    assert!(status.agents.iter().all(|ag| ag.state == AgentState::Idle));
    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// 4. Shutdown
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn shutdown_times_out_in_flight_task_and_stops_admission() {
    let orch = Orchestrator::start(config()).await.unwrap();
    let agent = orch.register_agent(Department::RnD, 1).unwrap();
    MockAgent::attach(&orch, agent, Mode::Manual);
    let task_id = orch
        .enqueue_task(Some(Department::RnD), serde_json::Value::Null)
        .unwrap();
    settle(20).await;
    assert_eq!(orch.task(task_id).unwrap().status, TaskStatus::Assigned);

    let report = orch.shutdown().await;
    assert_eq!(report.timed_out, vec![task_id]);
    assert!(report.drained.is_empty());

    let status = orch.status();
    assert_eq!(
        status.task(task_id).unwrap().status,
        TaskStatus::Failed {
            reason: FailureReason::ShutdownTimeout
        }
    );
    assert!(status.agents[0].active_task_ids.is_empty());
    assert!(matches!(
        orch.enqueue_task(None, serde_json::Value::Null),
        Err(CohortError::ShuttingDown)
    ));
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_answering_agents() {
    let orch = Orchestrator::start(config()).await.unwrap();
    let agent = orch.register_agent(Department::Growth, 2).unwrap();
    MockAgent::attach(&orch, agent, Mode::Succeed(Duration::from_millis(200)));
    let task_id = orch
        .enqueue_task(Some(Department::Growth), serde_json::Value::Null)
        .unwrap();
    settle(20).await;

    let report = orch.shutdown().await;
    assert_eq!(report.drained, vec![task_id]);
    assert!(report.timed_out.is_empty());
    assert_eq!(orch.task(task_id).unwrap().status, TaskStatus::Completed);
}

// ---------------------------------------------------------------------------
// 5. Responses: idempotence and unmatched correlation ids
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn duplicate_response_is_a_no_op() {
    let orch = Orchestrator::start(config()).await.unwrap();
    let mut tasks = orch.subscribe(&[Topic::Tasks]);
    let agent = orch.register_agent(Department::Backend, 1).unwrap();
    MockAgent::attach(&orch, agent, Mode::Manual);
    let task_id = orch.enqueue_task(None, serde_json::Value::Null).unwrap();
    settle(20).await;

    respond(&orch, agent, task_id).await;
    respond(&orch, agent, task_id).await;
    settle(30).await;

    let status = orch.status();
    assert_eq!(status.counts.completed, 1);
    assert_eq!(status.unmatched_responses, 0);
    let completions = drain(&mut tasks)
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::TaskCompleted { .. }))
        .count();
    assert_eq!(completions, 1);

    // A response nobody asked for is dropped and counted.
    respond(&orch, agent, uuid::Uuid::new_v4()).await;
    settle(30).await;
    assert_eq!(orch.status().unmatched_responses, 1);
    assert_eq!(orch.status().counts.completed, 1);
    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// 6. KPIs and alerts through the bus
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn kpi_rollups_agree_across_scopes() {
    let orch = Orchestrator::start(config()).await.unwrap();
    let agents: Vec<AgentId> = Department::ALL
        .iter()
        .map(|d| orch.register_agent(*d, 1).unwrap())
        .collect();

    for (i, agent) in agents.iter().enumerate() {
        for v in 0..5 {
            let value = (i * 10 + v) as f64;
            let receipt = orch.bus().send(Message::metric(*agent, "throughput", value)).await;
            assert!(receipt.is_delivered());
        }
    }
    orch.record_metric(agents[0], "throughput", 100.0).unwrap();

    let status = orch.status();
    let system = &status.system.metrics["throughput"];
    let dept_sum: f64 = status
        .departments
        .iter()
        .map(|s| s.metrics["throughput"].sum)
        .sum();
    let dept_count: u64 = status
        .departments
        .iter()
        .map(|s| s.metrics["throughput"].count)
        .sum();
    assert_eq!(system.sum, dept_sum);
    assert_eq!(system.count, dept_count);
    assert_eq!(system.count, 21);
    assert_eq!(
        orch.rollup(KpiScope::Department(Department::Growth)).metrics["throughput"].max,
        100.0
    );
    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn threshold_alerts_are_edge_triggered() {
    let orch = Orchestrator::start(config()).await.unwrap();
    let mut alerts = orch.subscribe(&[Topic::Alerts]);
    let agent = orch.register_agent(Department::Growth, 1).unwrap();
    orch.register_threshold(ThresholdRule::new(
        "error_rate",
        Comparison::GreaterThan,
        0.1,
        Severity::Warning,
    ))
    .unwrap();
    assert!(matches!(
        orch.register_threshold(ThresholdRule::new(
            "error_rate",
            Comparison::GreaterThan,
            f64::INFINITY,
            Severity::Warning
        )),
        Err(CohortError::AlertThresholdError(_))
    ));

    for v in [0.0, 0.5, 0.6, 0.7, 0.9, 0.05, 0.02] {
        orch.bus().send(Message::metric(agent, "error_rate", v)).await;
    }

    let states: Vec<AlertState> = drain(&mut alerts)
        .into_iter()
        .filter_map(|event| match event {
            EngineEvent::Alert { alert } => Some(alert.state),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![AlertState::Raised, AlertState::Resolved]);
    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn agent_alerts_are_forwarded() {
    let orch = Orchestrator::start(config()).await.unwrap();
    let mut alerts = orch.subscribe(&[Topic::Alerts]);
    let agent = orch.register_agent(Department::RnD, 1).unwrap();

    let alert = Alert::new(
        AlertState::Raised,
        Severity::Critical,
        AlertSource::Agent { agent_id: agent },
        "GPU quota exhausted",
    );
    let receipt = orch.bus().send(Message::alert(agent, alert.clone())).await;
    assert!(receipt.is_delivered());

    let forwarded = alerts.try_recv().unwrap();
    assert_eq!(forwarded.event, EngineEvent::Alert { alert });

    // Unknown senders are refused by the orchestrator.
    let stranger = orch
        .bus()
        .send(Message::metric(uuid::Uuid::new_v4(), "x", 1.0))
        .await;
    assert!(!stranger.is_delivered());
    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// 7. Delivery failure and liveness of the whole workload
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn undeliverable_agent_is_degraded_and_task_moves_on() {
    let mut cfg = config();
    cfg.bus.backoff_base_ms = 100;
    cfg.bus.backoff_max_ms = 100;
    let orch = Orchestrator::start(cfg).await.unwrap();
    // Registered but never attached: nothing acknowledges its messages.
    let broken = orch.register_agent(Department::Backend, 1).unwrap();
    let task_id = orch
        .enqueue_task(Some(Department::Backend), serde_json::Value::Null)
        .unwrap();
    settle(20).await;
    assert_eq!(orch.task(task_id).unwrap().assigned_agent, Some(broken));

    let healthy = orch.register_agent(Department::Backend, 1).unwrap();
    MockAgent::attach(&orch, healthy, Mode::Succeed(Duration::from_millis(10)));
    settle(500).await;

    let status = orch.status();
    let task = status.task(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempt_count, 2);
    let broken_state = status.agents.iter().find(|a| a.id == broken).unwrap().state;
    assert_eq!(broken_state, AgentState::Degraded);
    assert!(status.bus.failed >= 1);
    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn every_task_reaches_a_terminal_state() {
    let orch = Orchestrator::start(config()).await.unwrap();
    for (i, dept) in Department::ALL.iter().enumerate() {
        let id = orch.register_agent(*dept, 2).unwrap();
        MockAgent::attach(&orch, id, Mode::Succeed(Duration::from_millis(5 + 7 * i as u64)));
    }

    let mut ids = Vec::new();
    for n in 0..24 {
        let hint = if n % 5 == 0 {
            None
        } else {
            Some(Department::ALL[n % Department::ALL.len()])
        };
        ids.push(orch.enqueue_task(hint, serde_json::json!({"n": n})).unwrap());
    }

    for _ in 0..200 {
        if orch.status().counts.completed == ids.len() {
            break;
        }
        settle(10).await;
    }

    let status = orch.status();
    assert_eq!(status.counts.completed, ids.len());
    for id in &ids {
        let task = status.task(*id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        if let Some(hint) = task.department_hint {
            let done_by: AgentId =
                serde_json::from_value(task.output.clone().unwrap()["done_by"].clone()).unwrap();
            let agent = status.agents.iter().find(|a| a.id == done_by).unwrap();
            assert_eq!(agent.department, hint);
        }
    }
    let report = orch.shutdown().await;
    assert!(report.timed_out.is_empty() && report.cancelled.is_empty());
}

// ---------------------------------------------------------------------------
// 8. State store replication and fan-out
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn terminal_status_and_events_reach_the_store() {
    let store = Arc::new(MemoryStateStore::new());
    let mut channel = store.subscribe("cohort:tasks");
    let orch = Orchestrator::start_with_store(config(), store.clone())
        .await
        .unwrap();
    let agent = orch.register_agent(Department::Growth, 1).unwrap();
    MockAgent::attach(&orch, agent, Mode::Succeed(Duration::from_millis(10)));

    let task_id = orch.enqueue_task(None, serde_json::Value::Null).unwrap();
    settle(100).await;
    orch.shutdown().await;

    let stored = store
        .get(&format!("cohort:task:{task_id}"))
        .await
        .unwrap()
        .unwrap();
    let replicated: Task = serde_json::from_str(&stored).unwrap();
    assert_eq!(replicated.status, TaskStatus::Completed);
    assert!(store.get(&format!("cohort:agent:{agent}")).await.unwrap().is_some());

    let first: BroadcastEnvelope = serde_json::from_str(&channel.recv().await.unwrap()).unwrap();
    assert!(matches!(first.event, EngineEvent::TaskAssigned { task_id: id, .. } if id == task_id));
}
