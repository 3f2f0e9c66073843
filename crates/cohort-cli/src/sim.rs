use async_trait::async_trait;
use cohort_core::{AgentId, CohortResult, Message, MessageBody, TaskOutcome};
use cohort_orchestrator::{CommunicationBus, MessageHandler};
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

/// Workload knobs for simulated agents.
#[derive(Debug, Clone, Copy)]
pub struct SimProfile {
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    /// Probability in `[0, 1]` that a task is reported as failed.
    pub failure_rate: f64,
}

impl Default for SimProfile {
    fn default() -> Self {
        Self {
            min_latency_ms: 20,
            max_latency_ms: 250,
            failure_rate: 0.1,
        }
    }
}

/// An in-process agent that "works" for a random time, then answers over the
/// bus and reports its latency as a metric.
pub struct SimulatedAgent {
    id: AgentId,
    bus: CommunicationBus,
    profile: SimProfile,
}

impl SimulatedAgent {
    pub fn new(id: AgentId, bus: CommunicationBus, profile: SimProfile) -> Self {
        Self { id, bus, profile }
    }
}

#[async_trait]
impl MessageHandler for SimulatedAgent {
    async fn deliver(&self, message: Message) -> CohortResult<()> {
        let (MessageBody::Task { payload }, Some(task_id)) = (message.body, message.correlation_id)
        else {
            return Ok(());
        };

        let (latency_ms, fails) = {
            let mut rng = rand::thread_rng();
            let low = self.profile.min_latency_ms;
            let high = self.profile.max_latency_ms.max(low);
            (
                rng.gen_range(low..=high),
                rng.gen_bool(failure_probability(self.profile.failure_rate)),
            )
        };

        let id = self.id;
        let bus = self.bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
            let outcome = if fails {
                TaskOutcome::Failure {
                    error: "simulated failure".into(),
                }
            } else {
                TaskOutcome::Success {
                    output: serde_json::json!({ "echo": payload, "latency_ms": latency_ms }),
                }
            };
            debug!(agent_id = %id, task_id = %task_id, latency_ms, fails, "Simulated agent answering");
            let messages = [
                Message::metric(id, "latency_ms", latency_ms as f64),
                Message::metric(id, "failure", if fails { 1.0 } else { 0.0 }),
                Message::response(id, task_id, outcome),
            ];
            for message in messages {
                let kind = message.kind();
                if let Err(e) = bus.send(message).await.into_result() {
                    warn!(agent_id = %id, task_id = %task_id, %kind, error = %e, "Simulated agent could not reach the orchestrator");
                }
            }
        });
        Ok(())
    }
}

/// `rate` as a probability `gen_bool` accepts. NaN counts as never failing.
fn failure_probability(rate: f64) -> f64 {
    if rate.is_nan() {
        0.0
    } else {
        rate.clamp(0.0, 1.0)
    }
}
