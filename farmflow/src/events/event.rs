//! Lifecycle events emitted by the batch coordinator.

use serde::Serialize;
use uuid::Uuid;

use crate::core::DetailStatus;
use crate::errors::ErrorCode;

/// A bulk operation lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum BulkEvent {
    /// Dispatch began.
    #[serde(rename = "bulk.started")]
    Started {
        /// Operation.
        operation_id: Uuid,
        /// Submitting organization.
        org_id: String,
        /// Records in the batch.
        total: usize,
    },
    /// One record reached a final state.
    #[serde(rename = "bulk.record_completed")]
    RecordCompleted {
        /// Operation.
        operation_id: Uuid,
        /// Upload position.
        record_index: usize,
        /// Outcome.
        status: DetailStatus,
        /// Failure code, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
    },
    /// Every record was processed.
    #[serde(rename = "bulk.completed")]
    Completed {
        /// Operation.
        operation_id: Uuid,
        /// Records onboarded.
        successful: usize,
        /// Records failed.
        failed: usize,
        /// Records skipped as duplicates.
        skipped: usize,
        /// Wall time of the run.
        duration_ms: i64,
    },
    /// The operator cancelled the run.
    #[serde(rename = "bulk.cancelled")]
    Cancelled {
        /// Operation.
        operation_id: Uuid,
        /// Cancellation reason.
        reason: String,
        /// Records finished before the stop.
        processed: usize,
    },
    /// The run could not finish.
    #[serde(rename = "bulk.failed")]
    Failed {
        /// Operation.
        operation_id: Uuid,
        /// What went wrong.
        reason: String,
    },
    /// An operator retry pass finished.
    #[serde(rename = "bulk.retry_completed")]
    RetryCompleted {
        /// Operation.
        operation_id: Uuid,
        /// Records re-run.
        retried: usize,
        /// Of those, records now successful or skipped.
        recovered: usize,
        /// Of those, records still failing.
        still_failed: usize,
    },
}

impl BulkEvent {
    /// Dotted event name, e.g. `bulk.started`.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => "bulk.started",
            Self::RecordCompleted { .. } => "bulk.record_completed",
            Self::Completed { .. } => "bulk.completed",
            Self::Cancelled { .. } => "bulk.cancelled",
            Self::Failed { .. } => "bulk.failed",
            Self::RetryCompleted { .. } => "bulk.retry_completed",
        }
    }

    /// Operation the event belongs to.
    #[must_use]
    pub fn operation_id(&self) -> Uuid {
        match self {
            Self::Started { operation_id, .. }
            | Self::RecordCompleted { operation_id, .. }
            | Self::Completed { operation_id, .. }
            | Self::Cancelled { operation_id, .. }
            | Self::Failed { operation_id, .. }
            | Self::RetryCompleted { operation_id, .. } => *operation_id,
        }
    }

    /// JSON payload, including the `type` tag.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Whether the event closes a run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Cancelled { .. } | Self::Failed { .. }
        )
    }
}
