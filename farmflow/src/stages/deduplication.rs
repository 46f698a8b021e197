//! Authoritative duplicate check against persisted farmers.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::guard::DependencyGuard;
use super::ports::FarmerRegistry;
use super::{Stage, StageFlow};
use crate::context::{DedupAction, DeduplicationResult, ProcessingContext, StageKind};
use crate::core::{DedupPolicy, FarmerRecord};
use crate::errors::StageError;

/// Looks up the record's phone within the submitting organization and applies
/// the batch's duplicate policy.
///
/// A farmer created by an earlier attempt of the same record is not a
/// duplicate; it is resumed.
#[derive(Clone)]
pub struct DeduplicationStage {
    registry: Arc<dyn FarmerRegistry>,
    guard: DependencyGuard,
    timeout: Duration,
}

impl std::fmt::Debug for DeduplicationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeduplicationStage")
            .field("breaker", &self.guard.breaker().name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl DeduplicationStage {
    /// Creates a new deduplication stage.
    #[must_use]
    pub fn new(registry: Arc<dyn FarmerRegistry>, guard: DependencyGuard) -> Self {
        Self {
            registry,
            guard,
            timeout: Duration::ZERO,
        }
    }

    /// Sets the stage timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Stage for DeduplicationStage {
    fn name(&self) -> &str {
        StageKind::Deduplication.as_str()
    }

    fn can_retry(&self) -> bool {
        true
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn process(
        &self,
        ctx: &mut ProcessingContext,
        record: FarmerRecord,
    ) -> Result<StageFlow, StageError> {
        let phone = ctx
            .require_validation(StageKind::Deduplication)?
            .normalized_phone
            .clone();
        let org_id = ctx.org_id().to_string();

        let existing = self
            .guard
            .call(ctx.cancellation(), "find_farmer_by_phone", || {
                self.registry.find_farmer_by_phone(&org_id, &phone)
            })
            .await?;

        let Some(farmer) = existing else {
            ctx.set_deduplication(DeduplicationResult {
                action: DedupAction::New,
                existing_farmer_id: None,
            });
            return Ok(StageFlow::Continue(record));
        };

        if ctx.resume().farmer_id.as_deref() == Some(farmer.id.as_str()) {
            debug!(record_index = ctx.record_index(), farmer_id = %farmer.id, "resuming earlier attempt");
            ctx.set_deduplication(DeduplicationResult {
                action: DedupAction::Resume,
                existing_farmer_id: Some(farmer.id),
            });
            return Ok(StageFlow::Continue(record));
        }

        let message = format!(
            "farmer with phone {phone} already exists in organization {org_id} (id {})",
            farmer.id
        );
        match ctx.dedup_policy() {
            DedupPolicy::Skip => {
                ctx.set_deduplication(DeduplicationResult {
                    action: DedupAction::Skipped,
                    existing_farmer_id: Some(farmer.id),
                });
                Ok(StageFlow::SkipRecord {
                    reason: format!("duplicate: {message}"),
                })
            }
            DedupPolicy::Error => Err(StageError::duplicate(message)),
            DedupPolicy::Update => {
                ctx.set_deduplication(DeduplicationResult {
                    action: DedupAction::Update,
                    existing_farmer_id: Some(farmer.id),
                });
                Ok(StageFlow::Continue(record))
            }
        }
    }
}
