//! Identity to organization linkage.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::guard::DependencyGuard;
use super::ports::LinkageService;
use super::{Stage, StageFlow};
use crate::context::{LinkageResult, ProcessingContext, StageKind};
use crate::core::FarmerRecord;
use crate::errors::{ServiceError, StageError};

/// Links the provisioned identity to the submitting organization.
///
/// An "already linked" conflict counts as success so a re-run is harmless.
#[derive(Clone)]
pub struct OrganizationLinkageStage {
    linkage: Arc<dyn LinkageService>,
    guard: DependencyGuard,
    timeout: Duration,
}

impl std::fmt::Debug for OrganizationLinkageStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrganizationLinkageStage")
            .field("breaker", &self.guard.breaker().name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl OrganizationLinkageStage {
    /// Creates a new linkage stage.
    #[must_use]
    pub fn new(linkage: Arc<dyn LinkageService>, guard: DependencyGuard) -> Self {
        Self {
            linkage,
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
impl Stage for OrganizationLinkageStage {
    fn name(&self) -> &str {
        StageKind::OrganizationLinkage.as_str()
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
        let identity_id = ctx
            .require_identity(StageKind::OrganizationLinkage)?
            .user_id
            .clone();
        let farmer_id = ctx
            .require_registration(StageKind::OrganizationLinkage)?
            .farmer_id
            .clone();
        let org_id = ctx.org_id().to_string();

        let linkage = &self.linkage;
        let (identity, org) = (identity_id.as_str(), org_id.as_str());
        self.guard
            .call(ctx.cancellation(), "link_farmer_to_org", || async move {
                match linkage.link_farmer_to_org(identity, org).await {
                    Err(ServiceError::Rejected { status: 409, .. }) => {
                        debug!(identity_id = identity, org_id = org, "identity already linked");
                        Ok(())
                    }
                    other => other,
                }
            })
            .await?;

        ctx.set_linkage(LinkageResult {
            farmer_id,
            org_id,
            linked_at: Utc::now(),
        });
        Ok(StageFlow::Continue(record))
    }
}
