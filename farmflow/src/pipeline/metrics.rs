//! Per-stage execution metrics.
//!
//! A [`PipelineMetrics`] is created by the caller and injected into the
//! pipeline; all workers write to it concurrently.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::errors::ErrorCode;

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
#[must_use]
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Counters and timings for one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    /// Total executions.
    pub executions: u64,
    /// Executions that returned a result.
    pub successes: u64,
    /// Executions that failed.
    pub failures: u64,
    /// Executions that skipped the stage or the record.
    pub skips: u64,
    /// Sum of all execution durations in milliseconds.
    pub total_duration_ms: f64,
    /// Fastest execution in milliseconds.
    pub min_duration_ms: Option<f64>,
    /// Slowest execution in milliseconds.
    pub max_duration_ms: f64,
    /// Failure count per error code.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub failures_by_code: HashMap<ErrorCode, u64>,
}

impl StageMetrics {
    /// Average execution duration in milliseconds.
    #[must_use]
    pub fn avg_duration_ms(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.total_duration_ms / self.executions as f64
        }
    }

    fn observe(&mut self, duration: Duration) {
        let ms = duration.as_micros() as f64 / 1000.0;
        self.executions += 1;
        self.total_duration_ms += ms;
        self.min_duration_ms = Some(self.min_duration_ms.map_or(ms, |min| min.min(ms)));
        self.max_duration_ms = self.max_duration_ms.max(ms);
    }
}

/// Concurrent-safe metrics accumulator keyed by stage name.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    stages: DashMap<String, StageMetrics>,
}

impl PipelineMetrics {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful stage execution.
    pub fn record_success(&self, stage: &str, duration: Duration) {
        let mut entry = self.stages.entry(stage.to_string()).or_default();
        entry.observe(duration);
        entry.successes += 1;
    }

    /// Records a stage that skipped itself or the record.
    pub fn record_skip(&self, stage: &str, duration: Duration) {
        let mut entry = self.stages.entry(stage.to_string()).or_default();
        entry.observe(duration);
        entry.skips += 1;
    }

    /// Records a failed stage execution.
    pub fn record_failure(&self, stage: &str, duration: Duration, code: ErrorCode) {
        let mut entry = self.stages.entry(stage.to_string()).or_default();
        entry.observe(duration);
        entry.failures += 1;
        *entry.failures_by_code.entry(code).or_insert(0) += 1;
    }

    /// Returns a copy of one stage's metrics.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<StageMetrics> {
        self.stages.get(name).map(|entry| entry.clone())
    }

    /// Returns a sorted copy of all stage metrics.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, StageMetrics> {
        self.stages
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Total executions across all stages.
    #[must_use]
    pub fn total_executions(&self) -> u64 {
        self.stages.iter().map(|entry| entry.executions).sum()
    }

    /// Clears all metrics.
    pub fn reset(&self) {
        self.stages.clear();
    }
}
