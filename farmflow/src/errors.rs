//! Error types for the onboarding pipeline.
//!
//! Stages fail with a [`StageError`]; the executor wraps it into a
//! [`PipelineError`] carrying the stage position and elapsed time. Calls to
//! external collaborators fail with [`ServiceError`], and the persistence and
//! coordinator layers have their own error enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Boxed error used as a wrapped cause.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Machine-readable classification of a record failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Missing or malformed input fields.
    ValidationFailed,
    /// The record duplicates an already onboarded farmer.
    DuplicateRecord,
    /// A dependency failed transiently (timeout, connection, unavailable).
    DependencyUnavailable,
    /// A dependency rejected the request permanently.
    DependencyRejected,
    /// A stage could not find the result of an earlier stage.
    MissingStageResult,
    /// A stage exceeded its deadline.
    Timeout,
    /// The circuit breaker protecting a dependency is open.
    CircuitOpen,
    /// The batch was cancelled while the record was in flight.
    Cancelled,
    /// Anything else.
    Internal,
}

impl ErrorCode {
    /// Returns the snake_case label used in metrics and persisted details.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationFailed => "validation_failed",
            Self::DuplicateRecord => "duplicate_record",
            Self::DependencyUnavailable => "dependency_unavailable",
            Self::DependencyRejected => "dependency_rejected",
            Self::MissingStageResult => "missing_stage_result",
            Self::Timeout => "timeout",
            Self::CircuitOpen => "circuit_open",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a single stage.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StageError {
    /// Failure classification.
    pub code: ErrorCode,
    /// Human readable message.
    pub message: String,
    /// Whether re-running the record may succeed.
    pub retryable: bool,
    /// The underlying cause, if any.
    #[source]
    pub source: Option<BoxError>,
}

impl StageError {
    /// Creates a new stage error.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retryable,
            source: None,
        }
    }

    /// Input validation failure. Never retryable.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message, false)
    }

    /// Duplicate record under the `error` policy. Never retryable.
    #[must_use]
    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DuplicateRecord, message, false)
    }

    /// An earlier stage's result is missing from the context.
    #[must_use]
    pub fn missing_result(stage: &str, needed: &str) -> Self {
        Self::new(
            ErrorCode::MissingStageResult,
            format!("stage '{stage}' requires the '{needed}' result but none was recorded"),
            false,
        )
    }

    /// Stage deadline exceeded. Timeouts are retryable.
    #[must_use]
    pub fn timeout(stage: &str, timeout: Duration) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("stage '{stage}' timeout after {}ms", timeout.as_millis()),
            true,
        )
    }

    /// The batch was cancelled before the record finished.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, reason, true)
    }

    /// Attaches the underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl From<ServiceError> for StageError {
    fn from(err: ServiceError) -> Self {
        let code = match &err {
            ServiceError::Transient(_) => ErrorCode::DependencyUnavailable,
            ServiceError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            ServiceError::NotFound(_) | ServiceError::Rejected { .. } => {
                ErrorCode::DependencyRejected
            }
        };
        let retryable = err.is_retryable();
        Self::new(code, err.to_string(), retryable).with_source(err)
    }
}

/// Error returned by the pipeline executor for one record.
#[derive(Debug, Error)]
#[error("stage '{stage}' (#{stage_index}) failed after {}ms: {message}", .elapsed.as_millis())]
pub struct PipelineError {
    /// Name of the failing stage.
    pub stage: String,
    /// Position of the failing stage in the pipeline.
    pub stage_index: usize,
    /// Failure classification.
    pub code: ErrorCode,
    /// Human readable message.
    pub message: String,
    /// Whether re-running the record may succeed.
    pub retryable: bool,
    /// Time spent in the failing stage.
    pub elapsed: Duration,
    /// The stage error.
    #[source]
    pub source: StageError,
}

impl PipelineError {
    /// Wraps a stage error with its position in the pipeline.
    #[must_use]
    pub fn from_stage(
        stage: impl Into<String>,
        stage_index: usize,
        elapsed: Duration,
        source: StageError,
    ) -> Self {
        Self {
            stage: stage.into(),
            stage_index,
            code: source.code,
            message: source.message.clone(),
            retryable: source.retryable,
            elapsed,
            source,
        }
    }
}

/// Error returned by an external collaborator (account, linkage, registry).
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The dependency rejected the request (4xx-style).
    #[error("rejected ({status}): {message}")]
    Rejected {
        /// Status code reported by the dependency.
        status: u16,
        /// Rejection message.
        message: String,
    },

    /// Transient failure; the call may succeed later.
    #[error("{0}")]
    Transient(String),

    /// The breaker in front of the dependency is open.
    #[error("circuit open for dependency '{dependency}'")]
    CircuitOpen {
        /// Name of the protected dependency.
        dependency: String,
    },
}

impl ServiceError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Returns true when a later attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) | Self::CircuitOpen { .. } => true,
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
            Self::NotFound(_) => false,
        }
    }
}

/// Errors from the bulk operation and processing detail stores.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// No bulk operation with this id.
    #[error("bulk operation not found: {0}")]
    OperationNotFound(Uuid),

    /// No detail row for this operation/index pair.
    #[error("processing detail not found: operation {operation_id}, record {record_index}")]
    DetailNotFound {
        /// Operation id.
        operation_id: Uuid,
        /// Record index.
        record_index: usize,
    },

    /// The requested lifecycle transition is not allowed.
    #[error("invalid transition for operation {operation_id}: {from} -> {to}")]
    InvalidTransition {
        /// Operation id.
        operation_id: Uuid,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// A counter update would break `processed <= total`.
    #[error("progress overflow for operation {0}: all records already processed")]
    ProgressOverflow(Uuid),

    /// The backing storage is unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the batch coordinator's public operations.
#[derive(Debug, Error)]
pub enum BatchError {
    /// A batch must contain at least one record.
    #[error("batch contains no records")]
    EmptyBatch,

    /// The operation is not running, so it cannot be cancelled.
    #[error("operation {0} is not running")]
    NotRunning(Uuid),

    /// The operation is still running, so it cannot be retried.
    #[error("operation {0} is still running")]
    StillRunning(Uuid),

    /// The background batch task failed to join.
    #[error("batch task for operation {operation_id} aborted: {message}")]
    TaskAborted {
        /// Operation id.
        operation_id: Uuid,
        /// Join error message.
        message: String,
    },

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration document is not valid JSON for the schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range.
    #[error("invalid config value for '{field}': {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_labels() {
        assert_eq!(ErrorCode::ValidationFailed.to_string(), "validation_failed");
        assert_eq!(ErrorCode::MissingStageResult.as_str(), "missing_stage_result");
        let json = serde_json::to_string(&ErrorCode::CircuitOpen).unwrap();
        assert_eq!(json, r#""circuit_open""#);
    }

    #[test]
    fn test_stage_error_constructors() {
        let err = StageError::validation("phone number must be 10 digits");
        assert_eq!(err.code, ErrorCode::ValidationFailed);
        assert!(!err.retryable);

        let err = StageError::timeout("identity_creation", Duration::from_millis(250));
        assert!(err.retryable);
        assert!(err.message.contains("timeout"));
    }

    #[test]
    fn test_service_error_conversion() {
        let err: StageError = ServiceError::transient("connection reset by peer").into();
        assert_eq!(err.code, ErrorCode::DependencyUnavailable);
        assert!(err.retryable);
        assert!(std::error::Error::source(&err).is_some());

        let err: StageError = ServiceError::rejected(409, "username taken").into();
        assert_eq!(err.code, ErrorCode::DependencyRejected);
        assert!(!err.retryable);
    }

    #[test]
    fn test_rejected_server_errors_are_retryable() {
        assert!(ServiceError::rejected(503, "unavailable").is_retryable());
        assert!(ServiceError::rejected(429, "slow down").is_retryable());
        assert!(!ServiceError::rejected(400, "bad request").is_retryable());
        assert!(!ServiceError::NotFound("account".into()).is_retryable());
    }

    #[test]
    fn test_pipeline_error_wraps_stage() {
        let stage_err = StageError::validation("first name is required");
        let err = PipelineError::from_stage("validation", 0, Duration::from_millis(3), stage_err);

        assert_eq!(err.stage, "validation");
        assert_eq!(err.stage_index, 0);
        assert_eq!(err.code, ErrorCode::ValidationFailed);
        assert!(!err.retryable);
        assert!(err.to_string().contains("first name is required"));
    }
}
