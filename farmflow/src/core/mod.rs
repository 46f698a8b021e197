//! Core domain types: statuses, deduplication policy and raw records.

mod record;
mod status;

pub use record::{Address, FarmerRecord};
pub use status::{DedupPolicy, DetailStatus, OperationStatus, StageStatus};
