//! Sequential stage executor for one record.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::metrics::{duration_ms, PipelineMetrics};
use crate::context::ProcessingContext;
use crate::core::FarmerRecord;
use crate::errors::{ErrorCode, PipelineError, StageError};
use crate::stages::{Stage, StageFlow};

/// How a record left the pipeline when no stage failed.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// Every stage ran; carries the final record.
    Completed(FarmerRecord),
    /// A stage decided the record should not be onboarded.
    Skipped {
        /// Stage that skipped the record.
        stage: String,
        /// Why.
        reason: String,
    },
}

impl PipelineOutcome {
    /// Returns true if the record was skipped.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

/// An ordered list of stages sharing one metrics accumulator.
///
/// Stages are added at construction time and run strictly in order. There
/// is no compatibility check between adjacent stages and no rollback of
/// earlier stages when a later one fails.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    /// Creates an empty pipeline writing to `metrics`.
    #[must_use]
    pub fn new(metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            stages: Vec::new(),
            metrics,
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn add_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Returns the stages in execution order.
    #[must_use]
    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    /// Returns the stage names in execution order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Removes every stage.
    #[must_use]
    pub fn reset(mut self) -> Self {
        self.stages.clear();
        self
    }

    /// Returns the shared metrics accumulator.
    #[must_use]
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Runs every stage in order, feeding each output into the next.
    ///
    /// Stops at the first failing stage and returns it wrapped with its name,
    /// position and elapsed time. A stage with a non-zero timeout runs under
    /// that deadline; exceeding it is a retryable failure. Cancellation is
    /// checked before each stage, so an in-flight stage always finishes.
    pub async fn execute(
        &self,
        ctx: &mut ProcessingContext,
        initial: FarmerRecord,
    ) -> Result<PipelineOutcome, PipelineError> {
        let mut record = initial;

        for (index, stage) in self.stages.iter().enumerate() {
            let name = stage.name();

            if ctx.cancellation().is_cancelled() {
                let reason = ctx.cancellation().reason().unwrap_or_default();
                debug!(
                    operation_id = %ctx.operation_id(),
                    record_index = ctx.record_index(),
                    stage = name,
                    "record interrupted by cancellation"
                );
                return Err(PipelineError::from_stage(
                    name,
                    index,
                    Duration::ZERO,
                    StageError::cancelled(format!("cancelled before stage '{name}': {reason}")),
                ));
            }

            let started = Instant::now();
            let limit = stage.timeout();
            let result = if limit.is_zero() {
                stage.process(ctx, record).await
            } else {
                match tokio::time::timeout(limit, stage.process(ctx, record)).await {
                    Ok(result) => result,
                    Err(_) => Err(StageError::timeout(name, limit)),
                }
            };
            let elapsed = started.elapsed();

            match result {
                Ok(StageFlow::Continue(next)) => {
                    self.metrics.record_success(name, elapsed);
                    debug!(
                        record_index = ctx.record_index(),
                        stage = name,
                        duration_ms = duration_ms(elapsed),
                        "stage completed"
                    );
                    record = next;
                }
                Ok(StageFlow::Skipped { record: next, reason }) => {
                    self.metrics.record_skip(name, elapsed);
                    debug!(record_index = ctx.record_index(), stage = name, %reason, "stage skipped");
                    record = next;
                }
                Ok(StageFlow::SkipRecord { reason }) => {
                    self.metrics.record_skip(name, elapsed);
                    debug!(record_index = ctx.record_index(), stage = name, %reason, "record skipped");
                    return Ok(PipelineOutcome::Skipped {
                        stage: name.to_string(),
                        reason,
                    });
                }
                Err(err) => {
                    self.metrics.record_failure(name, elapsed, err.code);
                    if err.code == ErrorCode::MissingStageResult {
                        error!(
                            operation_id = %ctx.operation_id(),
                            record_index = ctx.record_index(),
                            stage = name,
                            error = %err,
                            "pipeline defect"
                        );
                    } else {
                        warn!(
                            operation_id = %ctx.operation_id(),
                            record_index = ctx.record_index(),
                            stage = name,
                            error_code = %err.code,
                            retryable = err.retryable,
                            error = %err,
                            "stage failed"
                        );
                    }
                    return Err(PipelineError::from_stage(name, index, elapsed, err));
                }
            }
        }

        Ok(PipelineOutcome::Completed(record))
    }
}
