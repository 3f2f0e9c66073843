use chrono::{DateTime, Utc};
use cohort_core::{AgentId, Department, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Lifecycle state of an agent as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    /// Registered, live, holding no tasks.
    Idle,
    /// Holding at least one task.
    Busy,
    /// Missed a response deadline or a delivery; not eligible until it is heard from again.
    Degraded,
    /// No heartbeat within the liveness timeout. Quarantined, never removed.
    Offline,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Idle => write!(f, "idle"),
            AgentState::Busy => write!(f, "busy"),
            AgentState::Degraded => write!(f, "degraded"),
            AgentState::Offline => write!(f, "offline"),
        }
    }
}

/// The orchestrator's view of one worker.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub id: AgentId,
    pub department: Department,
    /// Max concurrent tasks, at least 1.
    pub capacity: u32,
    pub active_task_ids: BTreeSet<TaskId>,
    pub registered_at: DateTime<Utc>,
    /// Wall-clock time of the last inbound message or heartbeat.
    pub last_seen_at: DateTime<Utc>,
    pub(crate) last_heartbeat: Instant,
    pub(crate) degraded: bool,
    pub(crate) offline: bool,
}

impl AgentHandle {
    pub fn new(id: AgentId, department: Department, capacity: u32) -> Self {
        let now = Utc::now();
        Self {
            id,
            department,
            capacity,
            active_task_ids: BTreeSet::new(),
            registered_at: now,
            last_seen_at: now,
            last_heartbeat: Instant::now(),
            degraded: false,
            offline: false,
        }
    }

    /// Offline overrides everything, then Degraded, then Busy/Idle by load.
    pub fn state(&self) -> AgentState {
        if self.offline {
            AgentState::Offline
        } else if self.degraded {
            AgentState::Degraded
        } else if self.active_task_ids.is_empty() {
            AgentState::Idle
        } else {
            AgentState::Busy
        }
    }

    pub fn spare_capacity(&self) -> u32 {
        self.capacity
            .saturating_sub(self.active_task_ids.len() as u32)
    }

    /// Idle, or Busy with spare capacity.
    pub fn is_eligible(&self) -> bool {
        !self.offline && !self.degraded && self.spare_capacity() > 0
    }

    pub fn heartbeat_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }

    /// Record an inbound message. Clears Degraded and Offline.
    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_heartbeat = now;
        self.last_seen_at = Utc::now();
        self.degraded = false;
        self.offline = false;
    }

    pub fn snapshot(&self, now: Instant) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id,
            department: self.department,
            state: self.state(),
            capacity: self.capacity,
            active_task_ids: self.active_task_ids.iter().copied().collect(),
            registered_at: self.registered_at,
            last_seen_at: self.last_seen_at,
            heartbeat_age_ms: self.heartbeat_age(now).as_millis() as u64,
        }
    }
}

/// Serializable point-in-time view of an [`AgentHandle`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub department: Department,
    pub state: AgentState,
    pub capacity: u32,
    pub active_task_ids: Vec<TaskId>,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub heartbeat_age_ms: u64,
}

/// Why a task ended in [`TaskStatus::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The task used up its attempt budget without a successful response.
    RetriesExhausted,
    /// The task was still assigned when the shutdown drain deadline passed.
    ShutdownTimeout,
    /// The task was still queued, never dispatched, when the engine shut down.
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::RetriesExhausted => write!(f, "retries_exhausted"),
            FailureReason::ShutdownTimeout => write!(f, "shutdown_timeout"),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status of a task in the task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Assigned,
    Completed,
    Failed { reason: FailureReason },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed { .. })
    }
}

/// A unit of work tracked by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub department_hint: Option<Department>,
    /// Opaque to the engine.
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub assigned_agent: Option<AgentId>,
    /// Incremented on every (re)assignment.
    pub attempt_count: u32,
    /// Agent that held the previous attempt; avoided on the next one when possible.
    #[serde(default)]
    pub last_agent: Option<AgentId>,
    /// Admission order, used for FIFO within a department.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Result body of a successful response.
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(skip)]
    pub(crate) deadline: Option<Instant>,
}

impl Task {
    pub fn new(department_hint: Option<Department>, payload: serde_json::Value) -> Self {
        Self::with_id(Uuid::new_v4(), department_hint, payload)
    }

    pub fn with_id(
        id: TaskId,
        department_hint: Option<Department>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id,
            department_hint,
            payload,
            status: TaskStatus::Queued,
            assigned_agent: None,
            attempt_count: 0,
            last_agent: None,
            sequence: 0,
            created_at: Utc::now(),
            assigned_at: None,
            completed_at: None,
            output: None,
            deadline: None,
        }
    }

    /// Whether this task may run on an agent of `department`.
    pub fn accepts(&self, department: Department) -> bool {
        self.department_hint.map_or(true, |d| d == department)
    }
}

/// Count of tasks per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub queued: usize,
    pub assigned: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.queued + self.assigned + self.completed + self.failed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation() {
        let task = Task::new(Some(Department::Growth), serde_json::json!({"n": 1}));
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempt_count, 0);
        assert!(task.assigned_agent.is_none());
        assert!(task.accepts(Department::Growth));
        assert!(!task.accepts(Department::Backend));
    }

    #[test]
    fn test_unhinted_task_accepts_any_department() {
        let task = Task::new(None, serde_json::Value::Null);
        for dept in Department::ALL {
            assert!(task.accepts(dept));
        }
    }

    #[test]
    fn test_agent_state_derivation() {
        let mut agent = AgentHandle::new(Uuid::new_v4(), Department::Backend, 2);
        assert_eq!(agent.state(), AgentState::Idle);
        assert!(agent.is_eligible());

        agent.active_task_ids.insert(Uuid::new_v4());
        assert_eq!(agent.state(), AgentState::Busy);
        assert_eq!(agent.spare_capacity(), 1);
        assert!(agent.is_eligible());

        agent.active_task_ids.insert(Uuid::new_v4());
        assert!(!agent.is_eligible());

        agent.degraded = true;
        assert_eq!(agent.state(), AgentState::Degraded);

        agent.offline = true;
        assert_eq!(agent.state(), AgentState::Offline);

        agent.touch(Instant::now());
        assert_eq!(agent.state(), AgentState::Busy);
    }

    #[test]
    fn test_task_status_serialization() {
        let status = TaskStatus::Failed {
            reason: FailureReason::RetriesExhausted,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("retries_exhausted"));
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
        assert!(parsed.is_terminal());
        assert!(!TaskStatus::Assigned.is_terminal());
    }
}
