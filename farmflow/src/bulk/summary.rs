//! Downloadable results of a bulk operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::detail::ProcessingDetail;
use super::operation::BulkOperation;
use crate::core::{DetailStatus, OperationStatus};
use crate::errors::ErrorCode;

/// One line of the results summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    /// Upload position.
    pub record_index: usize,
    /// Outcome.
    pub status: DetailStatus,
    /// Full name as uploaded.
    pub name: String,
    /// Phone as uploaded.
    pub phone_number: String,
    /// Farmer created or reused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub farmer_id: Option<String>,
    /// Failure message or skip reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Failure classification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    /// Stage that failed or skipped the record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Retries performed.
    pub retry_count: u32,
}

impl From<&ProcessingDetail> for RecordSummary {
    fn from(detail: &ProcessingDetail) -> Self {
        Self {
            record_index: detail.record_index,
            status: detail.status,
            name: detail.record.full_name(),
            phone_number: detail.record.phone_number.clone(),
            farmer_id: detail.farmer_id.clone(),
            message: detail.error_message.clone(),
            error_code: detail.error_code,
            stage: detail.stage.clone(),
            retry_count: detail.retry_count,
        }
    }
}

/// Aggregate counts plus one row per record, ordered by index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsSummary {
    /// Operation.
    pub operation_id: Uuid,
    /// Submitting organization.
    pub org_id: String,
    /// Uploaded file name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    /// Lifecycle status.
    pub status: OperationStatus,
    /// Records in the batch.
    pub total: usize,
    /// Records with an outcome.
    pub processed: usize,
    /// Records onboarded.
    pub successful: usize,
    /// Records failed.
    pub failed: usize,
    /// Records skipped.
    pub skipped: usize,
    /// `successful / processed`.
    pub success_rate: f64,
    /// Run duration, once terminal.
    pub processing_duration_ms: Option<i64>,
    /// First dispatch.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Per-record rows.
    pub records: Vec<RecordSummary>,
}

impl ResultsSummary {
    /// Builds a summary; `details` are re-sorted by record index.
    #[must_use]
    pub fn new(operation: &BulkOperation, details: &[ProcessingDetail]) -> Self {
        let mut records: Vec<RecordSummary> = details.iter().map(RecordSummary::from).collect();
        records.sort_by_key(|record| record.record_index);
        Self {
            operation_id: operation.id,
            org_id: operation.org_id.clone(),
            source_file: operation.options.source_file.clone(),
            status: operation.status,
            total: operation.total,
            processed: operation.processed,
            successful: operation.successful,
            failed: operation.failed,
            skipped: operation.skipped,
            success_rate: operation.success_rate(),
            processing_duration_ms: operation.processing_duration_ms,
            started_at: operation.started_at,
            completed_at: operation.completed_at,
            records,
        }
    }

    /// Rows with the given status.
    pub fn records_with_status(&self, status: DetailStatus) -> impl Iterator<Item = &RecordSummary> {
        self.records.iter().filter(move |record| record.status == status)
    }

    /// Pretty-printed JSON document.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
