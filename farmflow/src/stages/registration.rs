//! Farmer creation in the domain registry.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::guard::DependencyGuard;
use super::ports::{FarmerProfile, FarmerRegistry};
use super::{Stage, StageFlow};
use crate::context::{DedupAction, ProcessingContext, RegistrationResult, StageKind};
use crate::core::FarmerRecord;
use crate::errors::StageError;

/// Creates the farmer record for the identity provisioned earlier.
///
/// Under the `update` duplicate policy the existing farmer is reconciled
/// instead; a farmer left by an earlier attempt of the record is reused as-is.
#[derive(Clone)]
pub struct DomainRegistrationStage {
    registry: Arc<dyn FarmerRegistry>,
    guard: DependencyGuard,
    timeout: Duration,
}

impl std::fmt::Debug for DomainRegistrationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainRegistrationStage")
            .field("breaker", &self.guard.breaker().name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl DomainRegistrationStage {
    /// Creates a new registration stage.
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
impl Stage for DomainRegistrationStage {
    fn name(&self) -> &str {
        StageKind::DomainRegistration.as_str()
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
        let user_id = ctx
            .require_identity(StageKind::DomainRegistration)?
            .user_id
            .clone();
        let existing = ctx
            .results()
            .deduplication
            .as_ref()
            .and_then(|dedup| dedup.existing_farmer_id.clone().map(|id| (dedup.action, id)));
        let profile = FarmerProfile::from_record(&record, user_id, ctx.org_id());

        let result = match existing {
            Some((DedupAction::Resume, farmer_id)) => {
                debug!(record_index = ctx.record_index(), %farmer_id, "farmer already registered by earlier attempt");
                RegistrationResult {
                    farmer_id,
                    reused_existing: true,
                }
            }
            Some((DedupAction::Update, farmer_id)) => {
                let farmer = self
                    .guard
                    .call(ctx.cancellation(), "update_farmer", || {
                        self.registry.update_farmer(&farmer_id, profile.clone())
                    })
                    .await?;
                debug!(record_index = ctx.record_index(), farmer_id = %farmer.id, "existing farmer reconciled");
                RegistrationResult {
                    farmer_id: farmer.id,
                    reused_existing: true,
                }
            }
            _ => {
                let farmer = self
                    .guard
                    .call(ctx.cancellation(), "create_farmer", || {
                        self.registry.create_farmer(profile.clone())
                    })
                    .await?;
                RegistrationResult {
                    farmer_id: farmer.id,
                    reused_existing: false,
                }
            }
        };

        ctx.set_registration(result);
        Ok(StageFlow::Continue(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{DeduplicationResult, IdentityResult};
    use crate::errors::{ErrorCode, ServiceError};
    use crate::pipeline::{BackoffConfig, CircuitBreaker, CircuitBreakerConfig};
    use crate::stages::ports::{Farmer, MockFarmerRegistry};
    use chrono::Utc;
    use mockall::predicate::eq;
    use uuid::Uuid;

    fn farmer(id: &str, profile: &FarmerProfile) -> Farmer {
        Farmer {
            id: id.into(),
            user_id: profile.user_id.clone(),
            org_id: profile.org_id.clone(),
            first_name: profile.first_name.clone(),
            last_name: profile.last_name.clone(),
            phone_number: profile.phone_number.clone(),
            email: profile.email.clone(),
            gender: profile.gender.clone(),
            date_of_birth: profile.date_of_birth.clone(),
            address: profile.address.clone(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn stage(registry: MockFarmerRegistry) -> DomainRegistrationStage {
        DomainRegistrationStage::new(
            Arc::new(registry),
            DependencyGuard::new(
                Arc::new(CircuitBreaker::new("registry", CircuitBreakerConfig::default())),
                BackoffConfig::new().with_initial_delay_ms(1).with_jitter(false),
            ),
        )
    }

    fn record() -> FarmerRecord {
        FarmerRecord::new("Ravi", "Kumar", "9876543210")
    }

    fn ctx(dedup: Option<DeduplicationResult>) -> ProcessingContext {
        let mut ctx = ProcessingContext::new(Uuid::new_v4(), "org-1", "admin", 0, record());
        ctx.set_identity(IdentityResult {
            user_id: "user-1".into(),
            username: "9876543210".into(),
            user_existed: false,
            password_generated: true,
        });
        if let Some(dedup) = dedup {
            ctx.set_deduplication(dedup);
        }
        ctx
    }

    #[tokio::test]
    async fn test_creates_farmer_for_identity() {
        let mut registry = MockFarmerRegistry::new();
        registry
            .expect_create_farmer()
            .withf(|profile| profile.user_id == "user-1" && profile.org_id == "org-1")
            .times(1)
            .returning(|profile| Ok(farmer("f-9", &profile)));

        let mut ctx = ctx(Some(DeduplicationResult {
            action: DedupAction::New,
            existing_farmer_id: None,
        }));
        stage(registry).process(&mut ctx, record()).await.unwrap();

        let result = ctx.results().registration.clone().unwrap();
        assert_eq!(result.farmer_id, "f-9");
        assert!(!result.reused_existing);
    }

    #[tokio::test]
    async fn test_update_policy_reconciles_existing() {
        let mut registry = MockFarmerRegistry::new();
        registry.expect_create_farmer().never();
        registry
            .expect_update_farmer()
            .with(eq("f-1"), mockall::predicate::always())
            .times(1)
            .returning(|id, profile| Ok(farmer(id, &profile)));

        let mut ctx = ctx(Some(DeduplicationResult {
            action: DedupAction::Update,
            existing_farmer_id: Some("f-1".into()),
        }));
        stage(registry).process(&mut ctx, record()).await.unwrap();

        let result = ctx.results().registration.clone().unwrap();
        assert_eq!(result.farmer_id, "f-1");
        assert!(result.reused_existing);
    }

    #[tokio::test]
    async fn test_resume_reuses_without_calling_registry() {
        let mut registry = MockFarmerRegistry::new();
        registry.expect_create_farmer().never();
        registry.expect_update_farmer().never();

        let mut ctx = ctx(Some(DeduplicationResult {
            action: DedupAction::Resume,
            existing_farmer_id: Some("f-2".into()),
        }));
        stage(registry).process(&mut ctx, record()).await.unwrap();
        assert_eq!(ctx.results().registration.as_ref().unwrap().farmer_id, "f-2");
    }

    #[tokio::test]
    async fn test_missing_identity_is_defect() {
        let mut ctx = ProcessingContext::new(Uuid::new_v4(), "org-1", "admin", 0, record());
        let err = stage(MockFarmerRegistry::new())
            .process(&mut ctx, record())
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::MissingStageResult);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retryable() {
        let mut registry = MockFarmerRegistry::new();
        registry
            .expect_create_farmer()
            .times(3)
            .returning(|_| Err(ServiceError::transient("broken pipe")));

        let mut ctx = ctx(None);
        let err = stage(registry).process(&mut ctx, record()).await.unwrap_err();
        assert!(err.retryable);
        assert!(ctx.results().registration.is_none());
    }
}
