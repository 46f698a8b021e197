//! # Farmflow
//!
//! Bulk farmer onboarding for agricultural organizations.
//!
//! An organization submits a batch of farmer records; each record runs
//! through a fixed six-stage pipeline:
//!
//! - **Validation**: required fields, phone/email/date formats, normalization
//! - **Deduplication**: lookup by phone within the organization
//! - **Identity creation**: reuse or provision a login account
//! - **Domain registration**: create or reconcile the farmer record
//! - **Organization linkage**: link the identity to the organization
//! - **Agent assignment**: optional, never fails the record
//!
//! Records are processed concurrently on a bounded worker pool. Calls to
//! external collaborators are retried with exponential backoff inside a
//! per-dependency circuit breaker. Progress, per-record outcomes and an
//! operator-triggered retry of failed records are exposed through the
//! [`bulk::BatchCoordinator`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use farmflow::prelude::*;
//!
//! let coordinator = BatchCoordinator::new(services, OnboardingConfig::default());
//! let id = coordinator
//!     .submit("org-1", "admin-1", records, BatchOptions::new())
//!     .await?;
//! let operation = coordinator.wait(id).await?;
//! println!("{} of {} onboarded", operation.successful, operation.total);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod bulk;
pub mod cancellation;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod stages;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bulk::{
        BatchCoordinator, BatchCoordinatorBuilder, BatchOptions, BulkOperation,
        BulkOperationStore, ProcessingDetail, ProcessingDetailStore, ResultsSummary,
        RetrySummary,
    };
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{OnboardingConfig, StageTimeouts};
    pub use crate::context::{ProcessingContext, StageKind, StageResults};
    pub use crate::core::{
        Address, DedupPolicy, DetailStatus, FarmerRecord, OperationStatus, StageStatus,
    };
    pub use crate::errors::{
        BatchError, ConfigError, ErrorCode, PipelineError, ServiceError, StageError, StoreError,
    };
    pub use crate::events::{BulkEvent, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{
        BackoffConfig, CircuitBreakerConfig, Pipeline, PipelineMetrics, StageMetrics,
    };
    pub use crate::stages::ports::{AccountService, FarmerRegistry, LinkageService};
    pub use crate::stages::{onboarding_pipeline, OnboardingServices, Stage, StageFlow};
}
