//! Multi-agent task orchestration engine with delivery guarantees and live KPIs.
//!
//! Agents grouped into departments receive tasks over a communication bus
//! with at-least-once delivery and per-pair ordering. A single scheduler
//! loop assigns queued tasks, retries them on other agents when a deadline
//! or heartbeat is missed, and fails them once their attempt budget is
//! spent. Agents report metrics that roll up per department and system-wide
//! and drive edge-triggered threshold alerts. Every state change is
//! published to topic subscribers and, optionally, to an external state store.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Control surface: register agents, enqueue tasks, status, shutdown.
//! - [`CommunicationBus`]: At-least-once message delivery with backoff and jitter.
//! - [`MetricsAggregator`]: Department and system KPI rollups with threshold alerts.
//! - [`EventBroadcaster`]: Non-blocking topic fan-out of engine events.
//! - [`StateStore`]: External key-value/pub-sub collaborator; [`MemoryStateStore`] in-process.
//! - [`OrchestratorConfig`]: TOML-loadable tuning for every component.

/// Message routing between the orchestrator and agents.
pub mod bus;
/// Event fan-out to subscribers.
pub mod broadcast;
/// Engine configuration.
pub mod config;
/// The orchestrator control surface.
pub mod engine;
/// KPI rollups and threshold rules.
pub mod metrics;
/// Agent handle registry.
pub mod registry;
mod replicator;
mod scheduler;
mod state;
/// External state store interface.
pub mod store;
/// Task table.
pub mod task_queue;
/// Shared orchestration types (agent handles, tasks, statuses).
pub mod types;

pub use broadcast::{BroadcastEnvelope, EngineEvent, EventBroadcaster, Subscription, Topic};
pub use bus::{BusStats, CommunicationBus, DeliveryReceipt, DeliveryStatus, MessageHandler};
pub use config::OrchestratorConfig;
pub use engine::{Orchestrator, OrchestratorStatus, ShutdownReport};
pub use metrics::{KpiScope, KpiSnapshot, MetricSummary, MetricsAggregator, Statistic, ThresholdRule};
pub use registry::{AgentRegistry, StateChange};
pub use store::{MemoryStateStore, StateStore};
pub use task_queue::TaskTable;
pub use types::{AgentHandle, AgentSnapshot, AgentState, FailureReason, Task, TaskCounts, TaskStatus};
