//! KPI rollups and threshold alerting.
//!
//! Every sample is applied to its department rollup and the system rollup
//! under a single lock, so no snapshot can see one scope updated without
//! the other. Windowed samples are evicted during the update itself.

use crate::config::MetricsConfig;
use crate::registry::AgentRegistry;
use cohort_core::{
    AgentId, Alert, AlertSource, AlertState, CohortError, CohortResult, Comparison, Department,
    Severity,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Where a rollup lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", content = "department", rename_all = "snake_case")]
pub enum KpiScope {
    System,
    Department(Department),
}

impl std::fmt::Display for KpiScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KpiScope::System => write!(f, "system"),
            KpiScope::Department(d) => write!(f, "{d}"),
        }
    }
}

/// Which statistic of a metric a threshold rule compares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    /// The most recent sample.
    #[default]
    Last,
    /// Mean of the samples currently in the window.
    WindowMean,
}

/// An alert rule on one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub metric: String,
    pub comparison: Comparison,
    pub threshold: f64,
    pub severity: Severity,
    /// Evaluate against this department's rollup. `None` means system-wide.
    #[serde(default)]
    pub department: Option<Department>,
    #[serde(default)]
    pub statistic: Statistic,
}

impl ThresholdRule {
    pub fn new(
        metric: impl Into<String>,
        comparison: Comparison,
        threshold: f64,
        severity: Severity,
    ) -> Self {
        Self {
            metric: metric.into(),
            comparison,
            threshold,
            severity,
            department: None,
            statistic: Statistic::Last,
        }
    }

    pub fn for_department(mut self, department: Department) -> Self {
        self.department = Some(department);
        self
    }

    pub fn with_statistic(mut self, statistic: Statistic) -> Self {
        self.statistic = statistic;
        self
    }

    pub fn scope(&self) -> KpiScope {
        self.department
            .map_or(KpiScope::System, KpiScope::Department)
    }

    /// Reject rules that could never be evaluated meaningfully.
    pub fn validate(&self) -> CohortResult<()> {
        if self.metric.trim().is_empty() {
            return Err(CohortError::AlertThresholdError(
                "metric name must not be empty".into(),
            ));
        }
        if !self.threshold.is_finite() {
            return Err(CohortError::AlertThresholdError(format!(
                "threshold for '{}' must be finite, got {}",
                self.metric, self.threshold
            )));
        }
        Ok(())
    }
}

/// Running aggregates for one metric in one scope.
#[derive(Debug, Clone)]
pub struct MetricRollup {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    last: f64,
    window: VecDeque<(Instant, f64)>,
}

impl MetricRollup {
    fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            last: 0.0,
            window: VecDeque::new(),
        }
    }

    fn update(&mut self, value: f64, now: Instant, window: Duration, capacity: usize) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.last = value;

        self.window.push_back((now, value));
        while let Some((at, _)) = self.window.front() {
            if now.saturating_duration_since(*at) > window || self.window.len() > capacity {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn window_mean(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        Some(self.window.iter().map(|(_, v)| v).sum::<f64>() / self.window.len() as f64)
    }

    fn statistic(&self, statistic: Statistic) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        match statistic {
            Statistic::Last => Some(self.last),
            Statistic::WindowMean => self.window_mean(),
        }
    }

    pub fn summary(&self) -> MetricSummary {
        MetricSummary {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            last: self.last,
            mean: if self.count == 0 {
                0.0
            } else {
                self.sum / self.count as f64
            },
            window_len: self.window.len(),
            window_mean: self.window_mean(),
        }
    }
}

/// Serializable view of a [`MetricRollup`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
    pub mean: f64,
    pub window_len: usize,
    pub window_mean: Option<f64>,
}

/// Every metric rollup of one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiSnapshot {
    pub scope: KpiScope,
    pub metrics: BTreeMap<String, MetricSummary>,
}

/// Result of one `record` call.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub department: Department,
    /// Department rollup of the recorded metric after the update.
    pub department_summary: MetricSummary,
    /// System rollup of the recorded metric after the update.
    pub system_summary: MetricSummary,
    /// Raised or Resolved alerts triggered by this sample.
    pub alerts: Vec<Alert>,
}

struct RuleState {
    rule: ThresholdRule,
    breached: bool,
}

#[derive(Default)]
struct Rollups {
    system: BTreeMap<String, MetricRollup>,
    departments: BTreeMap<Department, BTreeMap<String, MetricRollup>>,
    rules: Vec<RuleState>,
}

impl Rollups {
    fn scope(&self, scope: KpiScope) -> Option<&BTreeMap<String, MetricRollup>> {
        match scope {
            KpiScope::System => Some(&self.system),
            KpiScope::Department(d) => self.departments.get(&d),
        }
    }

    /// Sum of `metric` over the department rollups, in department order.
    fn department_sum(&self, metric: &str) -> f64 {
        self.departments
            .values()
            .filter_map(|m| m.get(metric))
            .fold(0.0, |acc, r| acc + r.sum)
    }

    fn summary(&self, scope: KpiScope, metric: &str, rollup: &MetricRollup) -> MetricSummary {
        let mut summary = rollup.summary();
        if scope == KpiScope::System {
            // Rebuilt from the department sums so both scopes agree exactly.
            summary.sum = self.department_sum(metric);
            summary.mean = if summary.count == 0 {
                0.0
            } else {
                summary.sum / summary.count as f64
            };
        }
        summary
    }

    fn snapshot(&self, scope: KpiScope) -> KpiSnapshot {
        KpiSnapshot {
            scope,
            metrics: self
                .scope(scope)
                .map(|m| {
                    m.iter()
                        .map(|(k, r)| (k.clone(), self.summary(scope, k, r)))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// Owns every KPI rollup. Reads the agent registry only to attribute samples.
pub struct MetricsAggregator {
    registry: Arc<AgentRegistry>,
    config: MetricsConfig,
    inner: Mutex<Rollups>,
}

impl MetricsAggregator {
    pub fn new(registry: Arc<AgentRegistry>, config: MetricsConfig) -> Self {
        Self {
            registry,
            config,
            inner: Mutex::new(Rollups::default()),
        }
    }

    /// Add an alert rule. Malformed rules are rejected, never ignored.
    pub fn register_threshold(&self, rule: ThresholdRule) -> CohortResult<()> {
        rule.validate()?;
        info!(
            metric = %rule.metric,
            scope = %rule.scope(),
            comparison = rule.comparison.symbol(),
            threshold = rule.threshold,
            severity = %rule.severity,
            "Threshold rule registered"
        );
        self.inner.lock().rules.push(RuleState {
            rule,
            breached: false,
        });
        Ok(())
    }

    pub fn rule_count(&self) -> usize {
        self.inner.lock().rules.len()
    }

    /// Apply one sample from `agent_id` and evaluate the rules for its metric.
    ///
    /// Returns `Ok(None)` for non-finite values, which are logged and skipped.
    pub fn record(
        &self,
        agent_id: AgentId,
        metric: &str,
        value: f64,
    ) -> CohortResult<Option<RecordOutcome>> {
        let department = self
            .registry
            .department_of(agent_id)
            .ok_or(CohortError::UnknownAgent(agent_id))?;

        if !value.is_finite() {
            warn!(agent_id = %agent_id, metric, value, "Ignoring non-finite metric sample");
            return Ok(None);
        }

        let now = Instant::now();
        let window = self.config.window();
        let capacity = self.config.window_capacity;

        let mut inner = self.inner.lock();
        let department_summary = {
            let rollup = inner
                .departments
                .entry(department)
                .or_default()
                .entry(metric.to_string())
                .or_insert_with(MetricRollup::new);
            rollup.update(value, now, window, capacity);
            rollup.summary()
        };
        inner
            .system
            .entry(metric.to_string())
            .or_insert_with(MetricRollup::new)
            .update(value, now, window, capacity);
        let system_summary = inner
            .system
            .get(metric)
            .map(|r| inner.summary(KpiScope::System, metric, r))
            .unwrap_or_else(|| MetricRollup::new().summary());

        let alerts = evaluate_rules(&mut inner, metric, department);
        drop(inner);

        debug!(agent_id = %agent_id, department = %department, metric, value, "Metric recorded");
        Ok(Some(RecordOutcome {
            department,
            department_summary,
            system_summary,
            alerts,
        }))
    }

    pub fn rollup(&self, scope: KpiScope) -> KpiSnapshot {
        self.inner.lock().snapshot(scope)
    }

    /// System rollup plus one rollup per department, read under one lock.
    pub fn snapshot_all(&self) -> (KpiSnapshot, Vec<KpiSnapshot>) {
        let inner = self.inner.lock();
        let system = inner.snapshot(KpiScope::System);
        let departments = inner
            .departments
            .keys()
            .map(|d| inner.snapshot(KpiScope::Department(*d)))
            .collect();
        (system, departments)
    }
}

fn evaluate_rules(inner: &mut Rollups, metric: &str, department: Department) -> Vec<Alert> {
    let Rollups {
        system,
        departments,
        rules,
    } = inner;

    let mut alerts = Vec::new();
    for state in rules.iter_mut() {
        let rule = &state.rule;
        if rule.metric != metric {
            continue;
        }
        let rollup = match rule.department {
            None => system.get(metric),
            Some(d) if d == department => departments.get(&d).and_then(|m| m.get(metric)),
            Some(_) => continue,
        };
        let Some(observed) = rollup.and_then(|r| r.statistic(rule.statistic)) else {
            continue;
        };

        let breached = rule.comparison.holds(observed, rule.threshold);
        if breached == state.breached {
            continue;
        }
        state.breached = breached;

        let (alert_state, severity, verb) = if breached {
            (AlertState::Raised, rule.severity, "crossed")
        } else {
            (AlertState::Resolved, Severity::Info, "recovered from")
        };
        let message = format!(
            "{} {} {verb} threshold {} {} (value {observed})",
            rule.scope(),
            rule.metric,
            rule.comparison.symbol(),
            rule.threshold
        );
        if breached {
            warn!(metric = %rule.metric, scope = %rule.scope(), value = observed, "Threshold alert raised");
        } else {
            info!(metric = %rule.metric, scope = %rule.scope(), value = observed, "Threshold alert resolved");
        }
        alerts.push(Alert::new(
            alert_state,
            severity,
            AlertSource::Threshold {
                metric: rule.metric.clone(),
                department: rule.department,
                comparison: rule.comparison,
                threshold: rule.threshold,
                value: observed,
            },
            message,
        ));
    }
    alerts
}
