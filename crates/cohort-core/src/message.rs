use crate::alert::Alert;
use crate::{AgentId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sender or recipient of a bus [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Endpoint {
    /// The master orchestrator.
    Orchestrator,
    /// A registered agent.
    Agent(AgentId),
}

impl Endpoint {
    /// The agent id, if this endpoint is an agent.
    pub fn agent_id(&self) -> Option<AgentId> {
        match self {
            Endpoint::Agent(id) => Some(*id),
            Endpoint::Orchestrator => None,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Orchestrator => write!(f, "orchestrator"),
            Endpoint::Agent(id) => write!(f, "agent:{id}"),
        }
    }
}

/// Discriminant of a [`MessageBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Work handed to an agent.
    Task,
    /// Result of a task, correlated to it.
    Response,
    /// An alert raised by an agent or the engine.
    Alert,
    /// A self-reported metric sample.
    Metric,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Task => write!(f, "task"),
            MessageKind::Response => write!(f, "response"),
            MessageKind::Alert => write!(f, "alert"),
            MessageKind::Metric => write!(f, "metric"),
        }
    }
}

/// Result reported by an agent for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The agent finished the task.
    Success {
        /// Opaque result body.
        #[serde(default)]
        output: serde_json::Value,
    },
    /// The agent gave up on the task.
    Failure {
        /// Agent-supplied description.
        error: String,
    },
}

impl TaskOutcome {
    /// Whether the outcome is a success.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success { .. })
    }
}

/// Kind-specific body of a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessageBody {
    /// Work for the recipient agent. The payload is opaque to the engine.
    Task {
        /// Opaque task payload.
        payload: serde_json::Value,
    },
    /// Outcome of the task named by the message's correlation id.
    Response {
        /// What the agent reports.
        outcome: TaskOutcome,
    },
    /// An alert.
    Alert {
        /// The alert itself.
        alert: Alert,
    },
    /// A metric sample.
    Metric {
        /// Metric name, e.g. `latency_ms`.
        name: String,
        /// Sample value.
        value: f64,
    },
}

impl MessageBody {
    /// The kind of this body.
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Task { .. } => MessageKind::Task,
            MessageBody::Response { .. } => MessageKind::Response,
            MessageBody::Alert { .. } => MessageKind::Alert,
            MessageBody::Metric { .. } => MessageKind::Metric,
        }
    }
}

/// A unit exchanged on the communication bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: Uuid,
    /// Who sent the message.
    pub sender: Endpoint,
    /// Who the message is for.
    pub recipient: Endpoint,
    /// Ties a response back to its task. Task and Response messages carry the task id.
    pub correlation_id: Option<Uuid>,
    /// Kind-specific body.
    pub body: MessageBody,
    /// UTC timestamp of when the message was created.
    pub sent_at: DateTime<Utc>,
    /// How many delivery attempts the bus has made so far.
    #[serde(default)]
    pub delivery_attempts: u32,
}

impl Message {
    /// Creates a new message with the given endpoints and body.
    pub fn new(sender: Endpoint, recipient: Endpoint, body: MessageBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            recipient,
            correlation_id: None,
            body,
            sent_at: Utc::now(),
            delivery_attempts: 0,
        }
    }

    /// A task message from the orchestrator to an agent, correlated by task id.
    pub fn task(agent_id: AgentId, task_id: TaskId, payload: serde_json::Value) -> Self {
        let mut msg = Self::new(
            Endpoint::Orchestrator,
            Endpoint::Agent(agent_id),
            MessageBody::Task { payload },
        );
        msg.correlation_id = Some(task_id);
        msg
    }

    /// A response from an agent to the orchestrator for the given task.
    pub fn response(agent_id: AgentId, task_id: TaskId, outcome: TaskOutcome) -> Self {
        let mut msg = Self::new(
            Endpoint::Agent(agent_id),
            Endpoint::Orchestrator,
            MessageBody::Response { outcome },
        );
        msg.correlation_id = Some(task_id);
        msg
    }

    /// A metric sample reported by an agent.
    pub fn metric(agent_id: AgentId, name: impl Into<String>, value: f64) -> Self {
        Self::new(
            Endpoint::Agent(agent_id),
            Endpoint::Orchestrator,
            MessageBody::Metric {
                name: name.into(),
                value,
            },
        )
    }

    /// An alert raised by an agent.
    pub fn alert(agent_id: AgentId, alert: Alert) -> Self {
        Self::new(
            Endpoint::Agent(agent_id),
            Endpoint::Orchestrator,
            MessageBody::Alert { alert },
        )
    }

    /// The kind of this message.
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_message_is_correlated() {
        let agent = Uuid::new_v4();
        let task = Uuid::new_v4();
        let msg = Message::task(agent, task, serde_json::json!({"op": "build"}));
        assert_eq!(msg.kind(), MessageKind::Task);
        assert_eq!(msg.sender, Endpoint::Orchestrator);
        assert_eq!(msg.recipient, Endpoint::Agent(agent));
        assert_eq!(msg.correlation_id, Some(task));
        assert_eq!(msg.delivery_attempts, 0);
    }

    #[test]
    fn test_metric_message_is_uncorrelated() {
        let msg = Message::metric(Uuid::new_v4(), "latency_ms", 12.5);
        assert_eq!(msg.kind(), MessageKind::Metric);
        assert!(msg.correlation_id.is_none());
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::response(
            Uuid::new_v4(),
            Uuid::new_v4(),
            TaskOutcome::Failure {
                error: "disk full".into(),
            },
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"kind\":\"response\""));
        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.body, msg.body);
        assert_eq!(parsed.sender, msg.sender);
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::Orchestrator.to_string(), "orchestrator");
        let id = Uuid::new_v4();
        assert_eq!(Endpoint::Agent(id).to_string(), format!("agent:{id}"));
        assert_eq!(Endpoint::Agent(id).agent_id(), Some(id));
    }
}
