use crate::types::{AgentHandle, AgentSnapshot, AgentState};
use cohort_core::{AgentId, CohortError, CohortResult, Department, TaskId};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// A liveness or health transition observed on an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub agent_id: AgentId,
    pub department: Department,
    pub from: AgentState,
    pub to: AgentState,
}

/// Agent handles keyed by id. Ordered so that "lowest id" tie-breaks are stable.
#[derive(Default)]
pub struct AgentTable {
    agents: BTreeMap<AgentId, AgentHandle>,
}

impl AgentTable {
    pub fn get(&self, id: AgentId) -> Option<&AgentHandle> {
        self.agents.get(&id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentHandle> {
        self.agents.values()
    }

    /// Pick the agent for a task.
    ///
    /// Candidates are eligible agents whose department satisfies `hint`. When
    /// more than one candidate exists, `avoid` is excluded. Among the rest the
    /// freshest heartbeat wins, then the lightest load, then the lowest id.
    pub fn select(&self, hint: Option<Department>, avoid: Option<AgentId>) -> Option<AgentId> {
        let eligible: Vec<&AgentHandle> = self
            .agents
            .values()
            .filter(|a| a.is_eligible() && hint.map_or(true, |d| a.department == d))
            .collect();

        let pool: Vec<&AgentHandle> = if eligible.len() > 1 {
            eligible
                .into_iter()
                .filter(|a| Some(a.id) != avoid)
                .collect()
        } else {
            eligible
        };

        pool.into_iter()
            .min_by(|a, b| {
                b.last_heartbeat
                    .cmp(&a.last_heartbeat)
                    .then(a.active_task_ids.len().cmp(&b.active_task_ids.len()))
                    .then(a.id.cmp(&b.id))
            })
            .map(|a| a.id)
    }

    pub(crate) fn assign(&mut self, agent: AgentId, task: TaskId) -> Option<StateChange> {
        self.transition(agent, |a| {
            a.active_task_ids.insert(task);
        })
    }

    pub(crate) fn release(&mut self, agent: AgentId, task: TaskId) -> Option<StateChange> {
        self.transition(agent, |a| {
            a.active_task_ids.remove(&task);
        })
    }

    pub(crate) fn mark_degraded(&mut self, agent: AgentId) -> Option<StateChange> {
        self.transition(agent, |a| a.degraded = true)
    }

    pub(crate) fn touch(&mut self, agent: AgentId, now: Instant) -> CohortResult<Option<StateChange>> {
        if !self.agents.contains_key(&agent) {
            return Err(CohortError::UnknownAgent(agent));
        }
        Ok(self.transition(agent, |a| a.touch(now)))
    }

    /// Mark every agent silent for longer than `timeout` as Offline. Returns
    /// the agents that went Offline on this sweep.
    pub(crate) fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<StateChange> {
        let stale: Vec<AgentId> = self
            .agents
            .values()
            .filter(|a| !a.offline && a.heartbeat_age(now) > timeout)
            .map(|a| a.id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.transition(id, |a| a.offline = true))
            .collect()
    }

    fn transition(
        &mut self,
        agent: AgentId,
        apply: impl FnOnce(&mut AgentHandle),
    ) -> Option<StateChange> {
        let handle = self.agents.get_mut(&agent)?;
        let from = handle.state();
        apply(handle);
        let to = handle.state();
        (from != to).then_some(StateChange {
            agent_id: agent,
            department: handle.department,
            from,
            to,
        })
    }

    pub fn snapshot(&self, now: Instant) -> Vec<AgentSnapshot> {
        self.agents.values().map(|a| a.snapshot(now)).collect()
    }
}

/// Registry of every agent the orchestrator has ever seen.
///
/// Handles are never removed while the process runs: a silent agent is
/// quarantined as Offline so its historical metrics stay attributable.
pub struct AgentRegistry {
    table: RwLock<AgentTable>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(AgentTable::default()),
        }
    }

    /// Add a new agent. Fails if the id is already registered.
    pub fn register(&self, id: AgentId, department: Department, capacity: u32) -> CohortResult<()> {
        if capacity == 0 {
            return Err(CohortError::InvalidCapacity(capacity));
        }
        let mut table = self.table.write();
        if table.agents.contains_key(&id) {
            return Err(CohortError::DuplicateRegistration { agent_id: id });
        }
        table
            .agents
            .insert(id, AgentHandle::new(id, department, capacity));
        Ok(())
    }

    /// Refresh an agent's heartbeat.
    pub fn touch(&self, id: AgentId) -> CohortResult<Option<StateChange>> {
        self.table.write().touch(id, Instant::now())
    }

    pub fn department_of(&self, id: AgentId) -> Option<Department> {
        self.table.read().get(id).map(|a| a.department)
    }

    pub fn contains(&self, id: AgentId) -> bool {
        self.table.read().get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    pub fn get(&self, id: AgentId) -> Option<AgentSnapshot> {
        self.table.read().get(id).map(|a| a.snapshot(Instant::now()))
    }

    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        self.table.read().snapshot(Instant::now())
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, AgentTable> {
        self.table.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, AgentTable> {
        self.table.write()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
