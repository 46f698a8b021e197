//! Bulk onboarding: operations, per-record details, persistence and the
//! coordinator that drives records through the pipeline.
//!
//! A [`BatchCoordinator`] accepts a batch, persists one pending
//! [`ProcessingDetail`] per record, then processes records on a bounded
//! worker pool. A single writer task flushes details in batches and folds
//! each outcome into the [`BulkOperation`] counters, which complete the
//! operation once every record has an outcome.

mod coordinator;
mod detail;
mod operation;
mod store;
mod summary;

#[cfg(test)]
mod integration_tests;

pub use coordinator::{BatchCoordinator, BatchCoordinatorBuilder, RetrySummary};
pub use detail::ProcessingDetail;
pub use operation::{BatchOptions, BulkOperation};
pub use store::{
    BulkOperationStore, InMemoryBulkOperationStore, InMemoryProcessingDetailStore,
    ProcessingDetailStore,
};
pub use summary::{RecordSummary, ResultsSummary};
