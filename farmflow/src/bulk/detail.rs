//! Per-record outcome rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{ResumeState, StageResults};
use crate::core::{DetailStatus, FarmerRecord};
use crate::errors::{ErrorCode, PipelineError};

/// The outcome of one input record within a bulk operation.
///
/// Keyed by `(operation_id, record_index)`; the index is the record's
/// position in the upload and never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingDetail {
    /// Owning operation.
    pub operation_id: Uuid,
    /// Upload position.
    pub record_index: usize,
    /// Outcome status.
    pub status: DetailStatus,
    /// The record as uploaded, kept for retries.
    pub record: FarmerRecord,
    /// Failure message, or the skip reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Failure classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    /// Stage that failed or skipped the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Whether a retry pass may re-process the record.
    #[serde(default)]
    pub retryable: bool,
    /// Operator-triggered retries so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Last time a worker finished the record.
    pub last_attempted_at: Option<DateTime<Utc>>,
    /// Account provisioned for the record, by any attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    /// Farmer registered for the record, by any attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub farmer_id: Option<String>,
    /// Stage results of the last attempt.
    #[serde(default)]
    pub results: StageResults,
    /// Insert time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

impl ProcessingDetail {
    /// Creates a pending detail.
    #[must_use]
    pub fn pending(operation_id: Uuid, record_index: usize, record: FarmerRecord) -> Self {
        let now = Utc::now();
        Self {
            operation_id,
            record_index,
            status: DetailStatus::Pending,
            record,
            error_message: None,
            error_code: None,
            stage: None,
            retryable: false,
            retry_count: 0,
            last_attempted_at: None,
            identity_id: None,
            farmer_id: None,
            results: StageResults::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Records a successful run.
    pub fn mark_success(&mut self, results: StageResults, now: DateTime<Utc>) {
        self.status = DetailStatus::Success;
        self.clear_error();
        self.finish_attempt(results, now);
    }

    /// Records a run that a stage skipped.
    pub fn mark_skipped(
        &mut self,
        stage: impl Into<String>,
        reason: impl Into<String>,
        results: StageResults,
        now: DateTime<Utc>,
    ) {
        self.status = DetailStatus::Skipped;
        self.clear_error();
        self.stage = Some(stage.into());
        self.error_message = Some(reason.into());
        self.finish_attempt(results, now);
    }

    /// Records a failed run.
    pub fn mark_failed(&mut self, error: &PipelineError, results: StageResults, now: DateTime<Utc>) {
        self.status = DetailStatus::Failed;
        self.error_message = Some(error.message.clone());
        self.error_code = Some(error.code);
        self.stage = Some(error.stage.clone());
        self.retryable = error.retryable;
        self.finish_attempt(results, now);
    }

    /// Whether a retry pass with this ceiling should re-process the record.
    #[must_use]
    pub fn is_retry_eligible(&self, max_retries: u32) -> bool {
        self.status == DetailStatus::Failed && self.retryable && self.retry_count < max_retries
    }

    /// Identifiers to seed into the next attempt's context.
    #[must_use]
    pub fn resume_state(&self) -> ResumeState {
        ResumeState {
            identity_id: self.identity_id.clone(),
            farmer_id: self.farmer_id.clone(),
        }
    }

    fn clear_error(&mut self) {
        self.error_message = None;
        self.error_code = None;
        self.stage = None;
        self.retryable = false;
    }

    fn finish_attempt(&mut self, results: StageResults, now: DateTime<Utc>) {
        if let Some(identity) = &results.identity {
            self.identity_id = Some(identity.user_id.clone());
        }
        if let Some(registration) = &results.registration {
            self.farmer_id = Some(registration.farmer_id.clone());
        }
        self.results = results;
        self.last_attempted_at = Some(now);
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{IdentityResult, RegistrationResult};
    use crate::errors::StageError;
    use std::time::Duration;

    fn detail() -> ProcessingDetail {
        ProcessingDetail::pending(Uuid::new_v4(), 3, FarmerRecord::new("Ravi", "Kumar", "9876543210"))
    }

    fn failure(retryable: bool) -> PipelineError {
        PipelineError::from_stage(
            "domain_registration",
            3,
            Duration::from_millis(12),
            StageError::new(ErrorCode::DependencyUnavailable, "registry down", retryable),
        )
    }

    fn partial_results() -> StageResults {
        StageResults {
            identity: Some(IdentityResult {
                user_id: "user-1".into(),
                username: "9876543210".into(),
                user_existed: false,
                password_generated: true,
            }),
            ..StageResults::default()
        }
    }

    #[test]
    fn test_failure_keeps_partial_identity() {
        let mut detail = detail();
        detail.mark_failed(&failure(true), partial_results(), Utc::now());

        assert_eq!(detail.status, DetailStatus::Failed);
        assert_eq!(detail.error_code, Some(ErrorCode::DependencyUnavailable));
        assert_eq!(detail.stage.as_deref(), Some("domain_registration"));
        assert_eq!(detail.resume_state().identity_id.as_deref(), Some("user-1"));
        assert!(detail.is_retry_eligible(3));
    }

    #[test]
    fn test_resume_ids_survive_shorter_attempt() {
        let mut detail = detail();
        detail.mark_failed(&failure(true), partial_results(), Utc::now());
        detail.mark_failed(&failure(true), StageResults::default(), Utc::now());
        assert_eq!(detail.identity_id.as_deref(), Some("user-1"));
    }

    #[test]
    fn test_success_clears_error() {
        let mut detail = detail();
        detail.mark_failed(&failure(true), partial_results(), Utc::now());
        let mut results = partial_results();
        results.registration = Some(RegistrationResult {
            farmer_id: "f-1".into(),
            reused_existing: false,
        });
        detail.mark_success(results, Utc::now());

        assert_eq!(detail.status, DetailStatus::Success);
        assert!(detail.error_message.is_none());
        assert!(!detail.retryable);
        assert_eq!(detail.farmer_id.as_deref(), Some("f-1"));
    }

    #[test]
    fn test_retry_eligibility() {
        let mut detail = detail();
        assert!(!detail.is_retry_eligible(3));

        detail.mark_failed(&failure(false), StageResults::default(), Utc::now());
        assert!(!detail.is_retry_eligible(3));

        detail.mark_failed(&failure(true), StageResults::default(), Utc::now());
        detail.retry_count = 3;
        assert!(!detail.is_retry_eligible(3));
    }

    #[test]
    fn test_skip_records_reason() {
        let mut detail = detail();
        detail.mark_skipped("deduplication", "duplicate: exists", StageResults::default(), Utc::now());
        assert_eq!(detail.status, DetailStatus::Skipped);
        assert_eq!(detail.error_message.as_deref(), Some("duplicate: exists"));
        assert!(detail.error_code.is_none());
    }
}
