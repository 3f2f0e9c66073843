use crate::types::{FailureReason, Task, TaskCounts, TaskStatus};
use chrono::Utc;
use cohort_core::{AgentId, Department, TaskId};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::time::Instant;

/// The task table: every admitted task, keyed by id, with its current status.
///
/// Terminal tasks stay in the table so `status()` can report their outcome.
/// Queued and Assigned tasks are also indexed by admission sequence, so a
/// scheduling pass only walks the tasks that can still move.
pub struct TaskTable {
    tasks: HashMap<TaskId, Task>,
    open: BTreeMap<u64, TaskId>,
    next_sequence: u64,
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            open: BTreeMap::new(),
            next_sequence: 0,
        }
    }

    /// Admit a task as Queued. Returns `false` (and leaves the table untouched)
    /// when a task with the same id already exists.
    pub fn add(&mut self, mut task: Task) -> bool {
        if self.tasks.contains_key(&task.id) {
            return false;
        }
        task.sequence = self.next_sequence;
        task.status = TaskStatus::Queued;
        self.next_sequence += 1;
        self.open.insert(task.sequence, task.id);
        self.tasks.insert(task.id, task);
        true
    }

    /// Queued and Assigned tasks in admission order.
    fn open_tasks(&self) -> impl Iterator<Item = &Task> + '_ {
        self.open.values().filter_map(|id| self.tasks.get(id))
    }

    /// Queued task ids in dispatch order: FIFO within each department lane,
    /// lanes interleaved round-robin starting at `rotation`. Tasks without a
    /// department hint form their own lane after the department lanes.
    pub fn dispatch_order(&self, rotation: usize) -> Vec<TaskId> {
        let mut lanes: Vec<VecDeque<TaskId>> = vec![VecDeque::new(); Department::ALL.len() + 1];
        for task in self.open_tasks().filter(|t| t.status == TaskStatus::Queued) {
            let lane = match task.department_hint {
                Some(dept) => lane_index(dept),
                None => Department::ALL.len(),
            };
            lanes[lane].push_back(task.id);
        }

        let lane_count = lanes.len();
        let mut order = Vec::new();
        loop {
            let mut progressed = false;
            for i in 0..lane_count {
                if let Some(id) = lanes[(rotation + i) % lane_count].pop_front() {
                    order.push(id);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        order
    }

    /// Transition a Queued task to Assigned and bump its attempt count.
    pub fn mark_assigned(&mut self, id: TaskId, agent: AgentId, deadline: Instant) -> bool {
        match self.tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Queued => {
                task.status = TaskStatus::Assigned;
                task.assigned_agent = Some(agent);
                task.attempt_count += 1;
                task.assigned_at = Some(Utc::now());
                task.deadline = Some(deadline);
                true
            }
            _ => false,
        }
    }

    /// Return an Assigned task to the queue, remembering which agent held it.
    pub fn requeue(&mut self, id: TaskId) -> bool {
        match self.tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Assigned => {
                task.status = TaskStatus::Queued;
                task.last_agent = task.assigned_agent.take();
                task.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Mark a task as completed. No-op on terminal tasks.
    pub fn mark_completed(&mut self, id: TaskId, output: serde_json::Value) -> bool {
        match self.tasks.get_mut(&id) {
            Some(task) if !task.status.is_terminal() => {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(Utc::now());
                task.output = Some(output);
                task.deadline = None;
                self.open.remove(&task.sequence);
                true
            }
            _ => false,
        }
    }

    /// Mark a task as failed. No-op on terminal tasks.
    pub fn mark_failed(&mut self, id: TaskId, reason: FailureReason) -> bool {
        match self.tasks.get_mut(&id) {
            Some(task) if !task.status.is_terminal() => {
                task.status = TaskStatus::Failed { reason };
                task.completed_at = Some(Utc::now());
                task.deadline = None;
                self.open.remove(&task.sequence);
                true
            }
            _ => false,
        }
    }

    /// Assigned tasks whose response deadline is at or before `now`.
    pub fn expired(&self, now: Instant) -> Vec<(TaskId, AgentId)> {
        self.open_tasks()
            .filter(|t| t.status == TaskStatus::Assigned && t.deadline.is_some_and(|d| d <= now))
            .filter_map(|t| t.assigned_agent.map(|agent| (t.id, agent)))
            .collect()
    }

    /// Ids of the tasks currently assigned to `agent`.
    pub fn assigned_to(&self, agent: AgentId) -> Vec<TaskId> {
        self.open_tasks()
            .filter(|t| t.status == TaskStatus::Assigned && t.assigned_agent == Some(agent))
            .map(|t| t.id)
            .collect()
    }

    /// Ids of every task in the given status, in admission order.
    pub fn with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        if !status.is_terminal() {
            return self
                .open_tasks()
                .filter(|t| t.status == status)
                .map(|t| t.id)
                .collect();
        }
        let mut matching: Vec<&Task> = self.tasks.values().filter(|t| t.status == status).collect();
        matching.sort_by_key(|t| t.sequence);
        matching.into_iter().map(|t| t.id).collect()
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// All tasks in admission order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Queued => counts.queued += 1,
                TaskStatus::Assigned => counts.assigned += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed { .. } => counts.failed += 1,
            }
        }
        counts
    }

    pub fn assigned_count(&self) -> usize {
        self.open_tasks()
            .filter(|t| t.status == TaskStatus::Assigned)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }

    /// Whether every task has reached a terminal status.
    pub fn is_done(&self) -> bool {
        self.open.is_empty()
    }

    /// Number of Queued and Assigned tasks.
    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

fn lane_index(dept: Department) -> usize {
    Department::ALL
        .iter()
        .position(|d| *d == dept)
        .unwrap_or(Department::ALL.len())
}
