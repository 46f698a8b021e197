//! Bulk operation lifecycle and aggregate counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{DedupPolicy, DetailStatus, OperationStatus};
use crate::errors::StoreError;

/// Options chosen when a batch is submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// What to do with records matching an existing farmer.
    #[serde(default)]
    pub dedup_policy: DedupPolicy,
    /// Field agent to assign to every onboarded farmer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Name of the uploaded file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
}

impl BatchOptions {
    /// Creates default options (skip duplicates, no agent).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the duplicate policy.
    #[must_use]
    pub fn with_dedup_policy(mut self, policy: DedupPolicy) -> Self {
        self.dedup_policy = policy;
        self
    }

    /// Sets the agent to assign.
    #[must_use]
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Sets the source file name.
    #[must_use]
    pub fn with_source_file(mut self, name: impl Into<String>) -> Self {
        self.source_file = Some(name.into());
        self
    }
}

/// One submitted batch of farmer records.
///
/// Counters only move through [`apply_outcome`](Self::apply_outcome) and
/// [`apply_retry_outcome`](Self::apply_retry_outcome), which keep
/// `processed <= total` and `processed == successful + failed + skipped`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOperation {
    /// Operation id.
    pub id: Uuid,
    /// Submitting organization.
    pub org_id: String,
    /// Submitting user.
    pub user_id: String,
    /// Lifecycle status.
    pub status: OperationStatus,
    /// Submission options.
    pub options: BatchOptions,
    /// Records in the batch.
    pub total: usize,
    /// Records with a final outcome.
    pub processed: usize,
    /// Records onboarded.
    pub successful: usize,
    /// Records that failed.
    pub failed: usize,
    /// Records skipped as duplicates.
    pub skipped: usize,
    /// Why the operation failed or was cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// First dispatch time.
    pub started_at: Option<DateTime<Utc>>,
    /// Time the operation reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// `completed_at - started_at` (or `- created_at` if never started).
    pub processing_duration_ms: Option<i64>,
    /// Soft-delete marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl BulkOperation {
    /// Creates a pending operation.
    #[must_use]
    pub fn new(
        org_id: impl Into<String>,
        user_id: impl Into<String>,
        total: usize,
        options: BatchOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id: org_id.into(),
            user_id: user_id.into(),
            status: OperationStatus::Pending,
            options,
            total,
            processed: 0,
            successful: 0,
            failed: 0,
            skipped: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            processing_duration_ms: None,
            deleted_at: None,
        }
    }

    /// Moves the operation to `Processing`.
    ///
    /// Returns `Ok(false)` if it was already processing; the start timestamp
    /// is only ever set once.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        match self.status {
            OperationStatus::Processing => Ok(false),
            OperationStatus::Pending => {
                self.status = OperationStatus::Processing;
                self.started_at.get_or_insert(now);
                Ok(true)
            }
            other => Err(self.invalid_transition(other, OperationStatus::Processing)),
        }
    }

    /// Counts one record outcome.
    ///
    /// Reaching `processed == total` while processing completes the
    /// operation, failures included.
    pub fn apply_outcome(
        &mut self,
        outcome: DetailStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.processed >= self.total {
            return Err(StoreError::ProgressOverflow(self.id));
        }
        match outcome {
            DetailStatus::Success => self.successful += 1,
            DetailStatus::Failed => self.failed += 1,
            DetailStatus::Skipped => self.skipped += 1,
            DetailStatus::Pending => return Ok(()),
        }
        self.processed += 1;

        if self.status == OperationStatus::Processing && self.processed >= self.total {
            self.finish(OperationStatus::Completed, None, now)?;
        }
        Ok(())
    }

    /// Moves one already counted record from `previous` to `next`.
    ///
    /// Used by retry passes; `processed` does not change and the lifecycle
    /// is not reopened.
    pub fn apply_retry_outcome(&mut self, previous: DetailStatus, next: DetailStatus) {
        if previous == next {
            return;
        }
        let taken = match previous {
            DetailStatus::Success => decrement(&mut self.successful),
            DetailStatus::Failed => decrement(&mut self.failed),
            DetailStatus::Skipped => decrement(&mut self.skipped),
            DetailStatus::Pending => false,
        };
        if !taken {
            return;
        }
        match next {
            DetailStatus::Success => self.successful += 1,
            DetailStatus::Failed => self.failed += 1,
            DetailStatus::Skipped => self.skipped += 1,
            DetailStatus::Pending => self.processed -= 1,
        }
    }

    /// Moves the operation to a terminal status.
    pub fn finish(
        &mut self,
        status: OperationStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if !status.is_terminal() || !self.status.can_transition_to(status) {
            return Err(self.invalid_transition(self.status, status));
        }
        self.status = status;
        self.error_message = error_message;
        self.completed_at = Some(now);
        let from = self.started_at.unwrap_or(self.created_at);
        self.processing_duration_ms = Some((now - from).num_milliseconds().max(0));
        Ok(())
    }

    /// Marks the operation deleted. Idempotent.
    pub fn soft_delete(&mut self, now: DateTime<Utc>) {
        self.deleted_at.get_or_insert(now);
    }

    /// Returns true once soft-deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Records not yet processed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.processed)
    }

    /// Fraction of processed records that succeeded, `0.0..=1.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.successful as f64 / self.processed as f64
        }
    }

    /// Processed share of the batch in percent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress_percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.processed as f64 * 100.0 / self.total as f64
        }
    }

    fn invalid_transition(&self, from: OperationStatus, to: OperationStatus) -> StoreError {
        StoreError::InvalidTransition {
            operation_id: self.id,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

fn decrement(counter: &mut usize) -> bool {
    if *counter == 0 {
        false
    } else {
        *counter -= 1;
        true
    }
}
