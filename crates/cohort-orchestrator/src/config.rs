use crate::metrics::ThresholdRule;
use cohort_core::{CohortError, CohortResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Full engine configuration, loadable from TOML. Every field has a default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl OrchestratorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> CohortResult<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| CohortError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML config file.
    pub async fn load(path: impl AsRef<Path>) -> CohortResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            CohortError::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Render the configuration back to TOML.
    pub fn to_toml_string(&self) -> CohortResult<String> {
        toml::to_string_pretty(self).map_err(|e| CohortError::Config(e.to_string()))
    }

    pub fn validate(&self) -> CohortResult<()> {
        let s = &self.scheduler;
        if s.max_attempts == 0 {
            return Err(CohortError::Config(
                "scheduler.max_attempts must be at least 1".into(),
            ));
        }
        if s.pass_interval_ms == 0 {
            return Err(CohortError::Config(
                "scheduler.pass_interval_ms must be positive".into(),
            ));
        }
        if s.response_deadline_ms == 0 || s.liveness_timeout_ms == 0 {
            return Err(CohortError::Config(
                "scheduler deadlines must be positive".into(),
            ));
        }

        let b = &self.bus;
        if b.max_attempts == 0 {
            return Err(CohortError::Config("bus.max_attempts must be at least 1".into()));
        }
        if b.ack_timeout_ms == 0 {
            return Err(CohortError::Config("bus.ack_timeout_ms must be positive".into()));
        }
        if b.backoff_base_ms > b.backoff_max_ms {
            return Err(CohortError::Config(format!(
                "bus.backoff_base_ms ({}) exceeds bus.backoff_max_ms ({})",
                b.backoff_base_ms, b.backoff_max_ms
            )));
        }
        if b.lane_capacity == 0 {
            return Err(CohortError::Config("bus.lane_capacity must be positive".into()));
        }

        if self.metrics.window_capacity == 0 || self.metrics.window_ms == 0 {
            return Err(CohortError::Config(
                "metrics window must be non-empty".into(),
            ));
        }
        for rule in &self.metrics.thresholds {
            rule.validate()?;
        }

        if self.store.replicate_interval_ms == 0 {
            return Err(CohortError::Config(
                "store.replicate_interval_ms must be positive".into(),
            ));
        }

        if self.broadcast.subscriber_buffer == 0 {
            return Err(CohortError::Config(
                "broadcast.subscriber_buffer must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between assignment passes when nothing wakes the loop earlier.
    #[serde(default = "default_pass_interval_ms")]
    pub pass_interval_ms: u64,
    /// How long an agent has to respond to a dispatched task.
    #[serde(default = "default_response_deadline_ms")]
    pub response_deadline_ms: u64,
    /// Attempts per task before it fails with `RetriesExhausted`.
    #[serde(default = "default_task_max_attempts")]
    pub max_attempts: u32,
    /// Silence after which an agent is marked Offline.
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,
}

impl SchedulerConfig {
    pub fn pass_interval(&self) -> Duration {
        Duration::from_millis(self.pass_interval_ms)
    }

    pub fn response_deadline(&self) -> Duration {
        Duration::from_millis(self.response_deadline_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pass_interval_ms: default_pass_interval_ms(),
            response_deadline_ms: default_response_deadline_ms(),
            max_attempts: default_task_max_attempts(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
        }
    }
}

/// Communication bus delivery and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Time a recipient has to acknowledge one delivery attempt.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Upper bound of the random delay added to each backoff.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// Delivery attempts per message, including the first.
    #[serde(default = "default_bus_max_attempts")]
    pub max_attempts: u32,
    /// Messages that may wait behind an in-flight delivery on one sender/recipient lane.
    #[serde(default = "default_lane_capacity")]
    pub lane_capacity: usize,
}

impl BusConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter_ms: default_jitter_ms(),
            max_attempts: default_bus_max_attempts(),
            lane_capacity: default_lane_capacity(),
        }
    }
}

/// KPI rollup windows and alert rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Age beyond which windowed samples are evicted.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Maximum samples kept per metric window.
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    #[serde(default)]
    pub thresholds: Vec<ThresholdRule>,
}

impl MetricsConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            window_capacity: default_window_capacity(),
            thresholds: Vec::new(),
        }
    }
}

/// Event fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Events buffered per subscriber before new ones are dropped for it.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    /// Prefix for state-store channels and keys.
    #[serde(default = "default_store_channel_prefix")]
    pub store_channel_prefix: String,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
            store_channel_prefix: default_store_channel_prefix(),
        }
    }
}

/// State-store replication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How often agent liveness is written to the store.
    #[serde(default = "default_replicate_interval_ms")]
    pub replicate_interval_ms: u64,
}

impl StoreConfig {
    pub fn replicate_interval(&self) -> Duration {
        Duration::from_millis(self.replicate_interval_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            replicate_interval_ms: default_replicate_interval_ms(),
        }
    }
}

/// Shutdown drain settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long in-flight tasks may keep running after `shutdown()`.
    #[serde(default = "default_drain_deadline_ms")]
    pub drain_deadline_ms: u64,
}

impl ShutdownConfig {
    pub fn drain_deadline(&self) -> Duration {
        Duration::from_millis(self.drain_deadline_ms)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_deadline_ms: default_drain_deadline_ms(),
        }
    }
}

fn default_pass_interval_ms() -> u64 {
    100
}
fn default_response_deadline_ms() -> u64 {
    30_000
}
fn default_task_max_attempts() -> u32 {
    3
}
fn default_liveness_timeout_ms() -> u64 {
    15_000
}
fn default_ack_timeout_ms() -> u64 {
    2_000
}
fn default_backoff_base_ms() -> u64 {
    100
}
fn default_backoff_max_ms() -> u64 {
    5_000
}
fn default_jitter_ms() -> u64 {
    50
}
fn default_bus_max_attempts() -> u32 {
    5
}
fn default_lane_capacity() -> usize {
    256
}
fn default_window_ms() -> u64 {
    60_000
}
fn default_window_capacity() -> usize {
    512
}
fn default_subscriber_buffer() -> usize {
    256
}
fn default_store_channel_prefix() -> String {
    "cohort".to_string()
}
fn default_replicate_interval_ms() -> u64 {
    5_000
}
fn default_drain_deadline_ms() -> u64 {
    10_000
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use cohort_core::{Comparison, Department, Severity};

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(config.bus.backoff_base_ms, 100);
        assert_eq!(config.bus.max_attempts, 5);
        assert_eq!(config.shutdown.drain_deadline(), Duration::from_secs(10));
        assert!(config.metrics.thresholds.is_empty());
        assert_eq!(config.broadcast.store_channel_prefix, "cohort");
    }

    #[test]
    fn test_partial_sections_and_thresholds() {
        let raw = r#"
            [scheduler]
            max_attempts = 5
            liveness_timeout_ms = 2000

            [[metrics.thresholds]]
            metric = "error_rate"
            comparison = "greater_than"
            threshold = 0.25
            severity = "critical"
            department = "backend"
        "#;
        let config = OrchestratorConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.scheduler.max_attempts, 5);
        assert_eq!(config.scheduler.pass_interval_ms, 100);
        assert_eq!(config.scheduler.liveness_timeout(), Duration::from_secs(2));

        let rule = &config.metrics.thresholds[0];
        assert_eq!(rule.metric, "error_rate");
        assert_eq!(rule.comparison, Comparison::GreaterThan);
        assert_eq!(rule.severity, Severity::Critical);
        assert_eq!(rule.department, Some(Department::Backend));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(OrchestratorConfig::from_toml_str("[scheduler]\nmax_attempts = 0").is_err());
        assert!(OrchestratorConfig::from_toml_str(
            "[bus]\nbackoff_base_ms = 900\nbackoff_max_ms = 100"
        )
        .is_err());
        assert!(OrchestratorConfig::from_toml_str("[scheduler]\nmax_attempts = \"x\"").is_err());
    }

    #[test]
    fn test_zero_replicate_interval_rejected() {
        let err = OrchestratorConfig::from_toml_str("[store]\nreplicate_interval_ms = 0").unwrap_err();
        assert!(matches!(err, CohortError::Config(ref msg) if msg.contains("replicate_interval_ms")));
    }

    #[test]
    fn test_malformed_threshold_fails_validation() {
        let raw = r#"
            [[metrics.thresholds]]
            metric = ""
            comparison = "less_than"
            threshold = 1.0
            severity = "warning"
        "#;
        let err = OrchestratorConfig::from_toml_str(raw).unwrap_err();
        assert!(matches!(err, CohortError::AlertThresholdError(_)));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cohort.toml");
        tokio::fs::write(&path, "[shutdown]\ndrain_deadline_ms = 250\n")
            .await
            .unwrap();
        let config = OrchestratorConfig::load(&path).await.unwrap();
        assert_eq!(config.shutdown.drain_deadline_ms, 250);

        let missing = OrchestratorConfig::load(dir.path().join("nope.toml")).await;
        assert!(matches!(missing, Err(CohortError::Config(_))));
    }

    #[test]
    fn test_roundtrip_to_toml() {
        let config = OrchestratorConfig::default();
        let rendered = config.to_toml_string().unwrap();
        let back = OrchestratorConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(back.bus.lane_capacity, config.bus.lane_capacity);
    }
}
