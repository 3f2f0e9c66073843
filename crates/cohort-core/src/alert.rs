use crate::{AgentId, Department, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How bad an alert is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Info,
    /// Needs attention.
    Warning,
    /// Needs attention now.
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Comparison a threshold rule applies to a metric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// `value > threshold`
    GreaterThan,
    /// `value >= threshold`
    GreaterOrEqual,
    /// `value < threshold`
    LessThan,
    /// `value <= threshold`
    LessOrEqual,
}

impl Comparison {
    /// Whether `value` violates the rule against `threshold`.
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::GreaterThan => value > threshold,
            Comparison::GreaterOrEqual => value >= threshold,
            Comparison::LessThan => value < threshold,
            Comparison::LessOrEqual => value <= threshold,
        }
    }

    /// Operator symbol for log lines and alert messages.
    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::GreaterThan => ">",
            Comparison::GreaterOrEqual => ">=",
            Comparison::LessThan => "<",
            Comparison::LessOrEqual => "<=",
        }
    }
}

/// Whether an alert opens or closes a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    /// The condition started.
    Raised,
    /// The condition cleared.
    Resolved,
}

/// What produced an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum AlertSource {
    /// A metric crossed a configured threshold.
    Threshold {
        /// Metric name.
        metric: String,
        /// Department scope of the rule; `None` for system-wide rules.
        department: Option<Department>,
        /// Rule comparison.
        comparison: Comparison,
        /// Rule threshold.
        threshold: f64,
        /// Value that caused the crossing.
        value: f64,
    },
    /// A task reached a failed terminal state.
    Task {
        /// The task.
        task_id: TaskId,
        /// Failure reason code.
        reason: String,
    },
    /// An agent changed liveness, or the agent itself raised the alert.
    Agent {
        /// The agent.
        agent_id: AgentId,
    },
}

/// An alert published on the broadcast layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Unique identifier for this alert event.
    pub id: Uuid,
    /// Raised or resolved.
    pub state: AlertState,
    /// Severity.
    pub severity: Severity,
    /// What produced the alert.
    #[serde(flatten)]
    pub source: AlertSource,
    /// Human-readable summary.
    pub message: String,
    /// When the alert was produced.
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    /// Creates a new alert stamped with the current time.
    pub fn new(
        state: AlertState,
        severity: Severity,
        source: AlertSource,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            state,
            severity,
            source,
            message: message.into(),
            raised_at: Utc::now(),
        }
    }

    /// Whether this alert opens a condition.
    pub fn is_raised(&self) -> bool {
        self.state == AlertState::Raised
    }
}
