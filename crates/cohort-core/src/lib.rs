//! Core types and error definitions for the Cohort orchestrator.
//!
//! This crate provides the vocabulary shared by the engine and whatever layer
//! wraps it: error handling, departments, bus messages and alerts.
//!
//! # Main types
//!
//! - [`CohortError`]: Unified error enum for all Cohort subsystems.
//! - [`CohortResult`]: Convenience alias for `Result<T, CohortError>`.
//! - [`Department`]: Fixed task-affinity grouping of agents.
//! - [`Endpoint`]: Sender/recipient of a bus message (an agent or the orchestrator).
//! - [`Message`]: A typed unit exchanged on the communication bus.
//! - [`Alert`]: A raised or resolved alert, from a threshold rule or the engine.

/// Alert types shared by the aggregator, the engine and agents.
pub mod alert;
/// Department enumeration.
pub mod department;
/// Bus message types.
pub mod message;

pub use alert::{Alert, AlertSource, AlertState, Comparison, Severity};
pub use department::Department;
pub use message::{Endpoint, Message, MessageBody, MessageKind, TaskOutcome};

use uuid::Uuid;

/// Stable identifier of an agent for the lifetime of the process.
pub type AgentId = Uuid;

/// Identifier of a task, caller-supplied or generated.
pub type TaskId = Uuid;

// --- Error types ---

/// Top-level error type for the Cohort orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum CohortError {
    /// `register_agent` was called for an id that is already registered.
    #[error("Agent {agent_id} is already registered")]
    DuplicateRegistration {
        /// The id that was registered twice.
        agent_id: AgentId,
    },

    /// The bus could not confirm delivery within its retry budget.
    #[error("Delivery of message {message_id} failed after {attempts} attempt(s): {reason}")]
    DeliveryFailed {
        /// The message that could not be delivered.
        message_id: Uuid,
        /// How many delivery attempts were made.
        attempts: u32,
        /// Last failure observed.
        reason: String,
    },

    /// A task exceeded its reassignment budget.
    #[error("Task {task_id} failed after {attempts} attempt(s)")]
    RetriesExhausted {
        /// The failed task.
        task_id: TaskId,
        /// Attempts consumed.
        attempts: u32,
    },

    /// A task was still in flight when the shutdown drain deadline passed.
    #[error("Task {task_id} was still in flight at the shutdown deadline")]
    ShutdownTimeout {
        /// The task that was force-failed.
        task_id: TaskId,
    },

    /// A response did not match any outstanding task and was dropped.
    #[error("Response with correlation id {correlation_id} matches no outstanding task")]
    UnmatchedResponse {
        /// The correlation id carried by the dropped response.
        correlation_id: Uuid,
    },

    /// A threshold rule was malformed and rejected.
    #[error("Alert threshold error: {0}")]
    AlertThresholdError(String),

    /// The referenced agent is not registered.
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    /// Agents must be able to run at least one task.
    #[error("Invalid capacity {0}: agents must accept at least one task")]
    InvalidCapacity(u32),

    /// The orchestrator no longer admits work.
    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from the external state store.
    #[error("State store error: {0}")]
    Store(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`CohortError`].
pub type CohortResult<T> = Result<T, CohortError>;
