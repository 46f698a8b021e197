//! Persistence traits for operations and details, with in-memory stores.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use super::detail::ProcessingDetail;
use super::operation::BulkOperation;
use crate::core::{DetailStatus, OperationStatus};
use crate::errors::StoreError;

/// Storage for bulk operations.
///
/// Counter updates are single atomic read-modify-write operations so
/// concurrent completions never lose an increment.
#[async_trait]
pub trait BulkOperationStore: Send + Sync {
    /// Inserts a new operation.
    async fn create(&self, operation: BulkOperation) -> Result<(), StoreError>;

    /// Loads an operation, deleted or not.
    async fn get(&self, id: Uuid) -> Result<BulkOperation, StoreError>;

    /// Non-deleted operations of an organization, newest first.
    async fn list_for_org(&self, org_id: &str) -> Result<Vec<BulkOperation>, StoreError>;

    /// Moves the operation to processing (idempotent).
    async fn mark_started(&self, id: Uuid) -> Result<BulkOperation, StoreError>;

    /// Counts one record outcome; may auto-complete the operation.
    async fn record_outcome(
        &self,
        id: Uuid,
        outcome: DetailStatus,
    ) -> Result<BulkOperation, StoreError>;

    /// Moves one counted record between outcome buckets.
    async fn record_retry_outcome(
        &self,
        id: Uuid,
        previous: DetailStatus,
        next: DetailStatus,
    ) -> Result<BulkOperation, StoreError>;

    /// Moves the operation to a terminal status.
    async fn finish(
        &self,
        id: Uuid,
        status: OperationStatus,
        error_message: Option<String>,
    ) -> Result<BulkOperation, StoreError>;

    /// Soft-deletes the operation.
    async fn soft_delete(&self, id: Uuid) -> Result<(), StoreError>;
}

/// Storage for per-record details.
#[async_trait]
pub trait ProcessingDetailStore: Send + Sync {
    /// Inserts details, ignoring rows whose key already exists.
    ///
    /// Returns the number of rows actually inserted.
    async fn insert_batch(&self, details: Vec<ProcessingDetail>) -> Result<usize, StoreError>;

    /// Overwrites one existing detail.
    async fn update(&self, detail: ProcessingDetail) -> Result<(), StoreError>;

    /// Overwrites several existing details; nothing is written if any is missing.
    async fn update_batch(&self, details: Vec<ProcessingDetail>) -> Result<(), StoreError>;

    /// Loads one detail.
    async fn get(&self, operation_id: Uuid, record_index: usize)
        -> Result<ProcessingDetail, StoreError>;

    /// All details of an operation ordered by record index.
    async fn list(&self, operation_id: Uuid) -> Result<Vec<ProcessingDetail>, StoreError>;

    /// Details with the given status ordered by record index.
    async fn list_by_status(
        &self,
        operation_id: Uuid,
        status: DetailStatus,
    ) -> Result<Vec<ProcessingDetail>, StoreError>;

    /// Failed details with `retry_count < max_retries`, ordered by index.
    async fn list_retryable(
        &self,
        operation_id: Uuid,
        max_retries: u32,
    ) -> Result<Vec<ProcessingDetail>, StoreError>;
}

/// In-memory [`BulkOperationStore`].
#[derive(Debug, Default)]
pub struct InMemoryBulkOperationStore {
    operations: Mutex<HashMap<Uuid, BulkOperation>>,
}

impl InMemoryBulkOperationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored operations, deleted included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.lock().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.lock().is_empty()
    }

    fn modify<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut BulkOperation) -> Result<T, StoreError>,
    ) -> Result<BulkOperation, StoreError> {
        let mut operations = self.operations.lock();
        let operation = operations
            .get_mut(&id)
            .ok_or(StoreError::OperationNotFound(id))?;
        // Apply to a copy so a rejected update leaves the row untouched.
        let mut updated = operation.clone();
        f(&mut updated)?;
        *operation = updated.clone();
        Ok(updated)
    }
}

#[async_trait]
impl BulkOperationStore for InMemoryBulkOperationStore {
    async fn create(&self, operation: BulkOperation) -> Result<(), StoreError> {
        self.operations.lock().insert(operation.id, operation);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<BulkOperation, StoreError> {
        self.operations
            .lock()
            .get(&id)
            .cloned()
            .ok_or(StoreError::OperationNotFound(id))
    }

    async fn list_for_org(&self, org_id: &str) -> Result<Vec<BulkOperation>, StoreError> {
        let mut operations: Vec<_> = self
            .operations
            .lock()
            .values()
            .filter(|op| op.org_id == org_id && !op.is_deleted())
            .cloned()
            .collect();
        operations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(operations)
    }

    async fn mark_started(&self, id: Uuid) -> Result<BulkOperation, StoreError> {
        self.modify(id, |op| op.start(Utc::now()))
    }

    async fn record_outcome(
        &self,
        id: Uuid,
        outcome: DetailStatus,
    ) -> Result<BulkOperation, StoreError> {
        self.modify(id, |op| op.apply_outcome(outcome, Utc::now()))
    }

    async fn record_retry_outcome(
        &self,
        id: Uuid,
        previous: DetailStatus,
        next: DetailStatus,
    ) -> Result<BulkOperation, StoreError> {
        self.modify(id, |op| {
            op.apply_retry_outcome(previous, next);
            Ok(())
        })
    }

    async fn finish(
        &self,
        id: Uuid,
        status: OperationStatus,
        error_message: Option<String>,
    ) -> Result<BulkOperation, StoreError> {
        self.modify(id, |op| op.finish(status, error_message, Utc::now()))
    }

    async fn soft_delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.modify(id, |op| {
            op.soft_delete(Utc::now());
            Ok(())
        })
        .map(|_| ())
    }
}

/// In-memory [`ProcessingDetailStore`] ordered by `(operation, index)`.
#[derive(Debug, Default)]
pub struct InMemoryProcessingDetailStore {
    details: Mutex<BTreeMap<(Uuid, usize), ProcessingDetail>>,
}

impl InMemoryProcessingDetailStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn collect(
        &self,
        operation_id: Uuid,
        filter: impl Fn(&ProcessingDetail) -> bool,
    ) -> Vec<ProcessingDetail> {
        self.details
            .lock()
            .range((operation_id, 0)..=(operation_id, usize::MAX))
            .map(|(_, detail)| detail)
            .filter(|detail| filter(detail))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ProcessingDetailStore for InMemoryProcessingDetailStore {
    async fn insert_batch(&self, details: Vec<ProcessingDetail>) -> Result<usize, StoreError> {
        let mut stored = self.details.lock();
        let mut inserted = 0;
        for detail in details {
            let key = (detail.operation_id, detail.record_index);
            if let std::collections::btree_map::Entry::Vacant(slot) = stored.entry(key) {
                slot.insert(detail);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn update(&self, detail: ProcessingDetail) -> Result<(), StoreError> {
        self.update_batch(vec![detail]).await
    }

    async fn update_batch(&self, details: Vec<ProcessingDetail>) -> Result<(), StoreError> {
        let mut stored = self.details.lock();
        if let Some(missing) = details
            .iter()
            .find(|detail| !stored.contains_key(&(detail.operation_id, detail.record_index)))
        {
            return Err(StoreError::DetailNotFound {
                operation_id: missing.operation_id,
                record_index: missing.record_index,
            });
        }
        for detail in details {
            stored.insert((detail.operation_id, detail.record_index), detail);
        }
        Ok(())
    }

    async fn get(
        &self,
        operation_id: Uuid,
        record_index: usize,
    ) -> Result<ProcessingDetail, StoreError> {
        self.details
            .lock()
            .get(&(operation_id, record_index))
            .cloned()
            .ok_or(StoreError::DetailNotFound {
                operation_id,
                record_index,
            })
    }

    async fn list(&self, operation_id: Uuid) -> Result<Vec<ProcessingDetail>, StoreError> {
        Ok(self.collect(operation_id, |_| true))
    }

    async fn list_by_status(
        &self,
        operation_id: Uuid,
        status: DetailStatus,
    ) -> Result<Vec<ProcessingDetail>, StoreError> {
        Ok(self.collect(operation_id, |detail| detail.status == status))
    }

    async fn list_retryable(
        &self,
        operation_id: Uuid,
        max_retries: u32,
    ) -> Result<Vec<ProcessingDetail>, StoreError> {
        Ok(self.collect(operation_id, |detail| {
            detail.status == DetailStatus::Failed && detail.retry_count < max_retries
        }))
    }
}
