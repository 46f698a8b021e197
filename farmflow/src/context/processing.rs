//! Per-record processing context.

use super::results::{
    AgentAssignmentResult, DeduplicationResult, IdentityResult, LinkageResult,
    RegistrationResult, StageKind, StageResults, ValidationResult,
};
use crate::cancellation::CancellationToken;
use crate::core::{DedupPolicy, FarmerRecord};
use crate::errors::StageError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Identifiers left behind by an earlier, failed attempt of the same record.
///
/// A retry pass seeds these so the re-run reuses what already exists instead
/// of provisioning twice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeState {
    /// Account created by an earlier attempt.
    pub identity_id: Option<String>,
    /// Farmer created by an earlier attempt.
    pub farmer_id: Option<String>,
}

impl ResumeState {
    /// Returns true if nothing was carried over.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.identity_id.is_none() && self.farmer_id.is_none()
    }
}

/// The mutable carrier of one record through one pipeline run.
///
/// Owned by exactly one worker and dropped once the outcome is persisted.
#[derive(Debug)]
pub struct ProcessingContext {
    operation_id: Uuid,
    org_id: String,
    user_id: String,
    record_index: usize,
    record: FarmerRecord,
    dedup_policy: DedupPolicy,
    agent_id: Option<String>,
    resume: ResumeState,
    results: StageResults,
    /// Free-form metadata for stages and callers.
    pub metadata: HashMap<String, serde_json::Value>,
    started_at: DateTime<Utc>,
    started: Instant,
    cancellation: Arc<CancellationToken>,
}

impl ProcessingContext {
    /// Creates a context for one record.
    #[must_use]
    pub fn new(
        operation_id: Uuid,
        org_id: impl Into<String>,
        user_id: impl Into<String>,
        record_index: usize,
        record: FarmerRecord,
    ) -> Self {
        Self {
            operation_id,
            org_id: org_id.into(),
            user_id: user_id.into(),
            record_index,
            record,
            dedup_policy: DedupPolicy::default(),
            agent_id: None,
            resume: ResumeState::default(),
            results: StageResults::default(),
            metadata: HashMap::new(),
            started_at: Utc::now(),
            started: Instant::now(),
            cancellation: Arc::new(CancellationToken::new()),
        }
    }

    /// Sets the deduplication policy.
    #[must_use]
    pub fn with_dedup_policy(mut self, policy: DedupPolicy) -> Self {
        self.dedup_policy = policy;
        self
    }

    /// Sets the agent to assign.
    #[must_use]
    pub fn with_agent_id(mut self, agent_id: Option<String>) -> Self {
        self.agent_id = agent_id.filter(|id| !id.trim().is_empty());
        self
    }

    /// Seeds identifiers from a previous attempt.
    #[must_use]
    pub fn with_resume(mut self, resume: ResumeState) -> Self {
        self.resume = resume;
        self
    }

    /// Shares the batch cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancellation = token;
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns the bulk operation id.
    #[must_use]
    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    /// Returns the owning organization.
    #[must_use]
    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    /// Returns the submitting user.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Returns the record's position in the upload.
    #[must_use]
    pub fn record_index(&self) -> usize {
        self.record_index
    }

    /// Returns the raw input record as uploaded.
    #[must_use]
    pub fn record(&self) -> &FarmerRecord {
        &self.record
    }

    /// Returns the deduplication policy.
    #[must_use]
    pub fn dedup_policy(&self) -> DedupPolicy {
        self.dedup_policy
    }

    /// Returns the agent to assign, if any.
    #[must_use]
    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    /// Returns identifiers carried over from an earlier attempt.
    #[must_use]
    pub fn resume(&self) -> &ResumeState {
        &self.resume
    }

    /// Returns the batch cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &Arc<CancellationToken> {
        &self.cancellation
    }

    /// Returns when processing of this record started.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Returns the time spent on this record so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Returns all recorded stage results.
    #[must_use]
    pub fn results(&self) -> &StageResults {
        &self.results
    }

    /// Consumes the context, returning its results.
    #[must_use]
    pub fn into_results(self) -> StageResults {
        self.results
    }

    /// Records the validation result.
    pub fn set_validation(&mut self, result: ValidationResult) {
        self.results.validation = Some(result);
    }

    /// Records the deduplication result.
    pub fn set_deduplication(&mut self, result: DeduplicationResult) {
        self.results.deduplication = Some(result);
    }

    /// Records the identity result.
    pub fn set_identity(&mut self, result: IdentityResult) {
        self.results.identity = Some(result);
    }

    /// Records the registration result.
    pub fn set_registration(&mut self, result: RegistrationResult) {
        self.results.registration = Some(result);
    }

    /// Records the linkage result.
    pub fn set_linkage(&mut self, result: LinkageResult) {
        self.results.linkage = Some(result);
    }

    /// Records the agent assignment result.
    pub fn set_agent_assignment(&mut self, result: AgentAssignmentResult) {
        self.results.agent_assignment = Some(result);
    }

    /// Returns the validation result or a stage-ordering error for `requester`.
    pub fn require_validation(&self, requester: StageKind) -> Result<&ValidationResult, StageError> {
        self.results
            .validation
            .as_ref()
            .ok_or_else(|| missing(requester, StageKind::Validation))
    }

    /// Returns the deduplication result or a stage-ordering error.
    pub fn require_deduplication(
        &self,
        requester: StageKind,
    ) -> Result<&DeduplicationResult, StageError> {
        self.results
            .deduplication
            .as_ref()
            .ok_or_else(|| missing(requester, StageKind::Deduplication))
    }

    /// Returns the identity result or a stage-ordering error.
    pub fn require_identity(&self, requester: StageKind) -> Result<&IdentityResult, StageError> {
        self.results
            .identity
            .as_ref()
            .ok_or_else(|| missing(requester, StageKind::IdentityCreation))
    }

    /// Returns the registration result or a stage-ordering error.
    pub fn require_registration(
        &self,
        requester: StageKind,
    ) -> Result<&RegistrationResult, StageError> {
        self.results
            .registration
            .as_ref()
            .ok_or_else(|| missing(requester, StageKind::DomainRegistration))
    }
}

fn missing(requester: StageKind, needed: StageKind) -> StageError {
    tracing::error!(
        stage = requester.as_str(),
        needed = needed.as_str(),
        "stage ordering violated: earlier result missing"
    );
    StageError::missing_result(requester.as_str(), needed.as_str())
}
