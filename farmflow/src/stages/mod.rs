//! Stage trait and the six onboarding stages.
//!
//! Stages are the units of work the [`Pipeline`] runs for each record. The
//! onboarding sequence is fixed and built explicitly by
//! [`onboarding_pipeline`]; each stage is also constructible on its own
//! against a context and the one capability it needs.

mod agent;
mod credentials;
mod deduplication;
mod guard;
mod identity;
mod linkage;
pub mod ports;
mod registration;
mod validation;

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::config::OnboardingConfig;
use crate::context::{ProcessingContext, StageKind};
use crate::core::FarmerRecord;
use crate::errors::StageError;
use crate::pipeline::{CircuitBreaker, Pipeline, PipelineMetrics};

pub use agent::{AgentAssignmentStage, NO_AGENT_REASON};
pub use credentials::{generate_password, generate_password_with, GeneratedPassword};
pub use deduplication::DeduplicationStage;
pub use guard::{DependencyBreakers, DependencyGuard};
pub use identity::IdentityCreationStage;
pub use linkage::OrganizationLinkageStage;
pub use ports::OnboardingServices;
pub use registration::DomainRegistrationStage;
pub use validation::{normalize_phone, ValidationStage};

/// What a stage hands back to the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum StageFlow {
    /// Stage done; continue with this record.
    Continue(FarmerRecord),
    /// Stage had nothing to do; continue with this record.
    Skipped {
        /// Record passed on unchanged.
        record: FarmerRecord,
        /// Why the stage did nothing.
        reason: String,
    },
    /// The record must not be onboarded; stop without error.
    SkipRecord {
        /// Why.
        reason: String,
    },
}

/// Trait for pipeline stages.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Returns true if a failure of this stage may succeed on a later attempt.
    fn can_retry(&self) -> bool;

    /// Deadline for one execution. Zero means none.
    fn timeout(&self) -> Duration;

    /// Processes one record.
    async fn process(
        &self,
        ctx: &mut ProcessingContext,
        record: FarmerRecord,
    ) -> Result<StageFlow, StageError>;
}

/// The closed set of onboarding stages.
#[derive(Debug)]
pub enum OnboardingStage {
    /// Required fields and formats.
    Validation(ValidationStage),
    /// Existing-farmer check.
    Deduplication(DeduplicationStage),
    /// Account lookup or provisioning.
    IdentityCreation(IdentityCreationStage),
    /// Farmer creation or reconciliation.
    DomainRegistration(DomainRegistrationStage),
    /// Identity to organization link.
    OrganizationLinkage(OrganizationLinkageStage),
    /// Optional field agent.
    AgentAssignment(AgentAssignmentStage),
}

impl OnboardingStage {
    /// Returns which of the six stages this is.
    #[must_use]
    pub fn kind(&self) -> StageKind {
        match self {
            Self::Validation(_) => StageKind::Validation,
            Self::Deduplication(_) => StageKind::Deduplication,
            Self::IdentityCreation(_) => StageKind::IdentityCreation,
            Self::DomainRegistration(_) => StageKind::DomainRegistration,
            Self::OrganizationLinkage(_) => StageKind::OrganizationLinkage,
            Self::AgentAssignment(_) => StageKind::AgentAssignment,
        }
    }

    fn inner(&self) -> &dyn Stage {
        match self {
            Self::Validation(stage) => stage,
            Self::Deduplication(stage) => stage,
            Self::IdentityCreation(stage) => stage,
            Self::DomainRegistration(stage) => stage,
            Self::OrganizationLinkage(stage) => stage,
            Self::AgentAssignment(stage) => stage,
        }
    }
}

#[async_trait]
impl Stage for OnboardingStage {
    fn name(&self) -> &str {
        self.kind().as_str()
    }

    fn can_retry(&self) -> bool {
        self.inner().can_retry()
    }

    fn timeout(&self) -> Duration {
        self.inner().timeout()
    }

    async fn process(
        &self,
        ctx: &mut ProcessingContext,
        record: FarmerRecord,
    ) -> Result<StageFlow, StageError> {
        self.inner().process(ctx, record).await
    }
}

/// Builds the fixed six-stage onboarding pipeline.
#[must_use]
pub fn onboarding_pipeline(
    services: &OnboardingServices,
    breakers: &DependencyBreakers,
    config: &OnboardingConfig,
    metrics: Arc<PipelineMetrics>,
) -> Pipeline {
    let timeouts = &config.stage_timeouts;
    let guard =
        |breaker: &Arc<CircuitBreaker>| DependencyGuard::new(breaker.clone(), config.retry.clone());

    let stages = [
        OnboardingStage::Validation(
            ValidationStage::new().with_timeout(timeouts.timeout_for(StageKind::Validation)),
        ),
        OnboardingStage::Deduplication(
            DeduplicationStage::new(services.registry.clone(), guard(&breakers.registry))
                .with_timeout(timeouts.timeout_for(StageKind::Deduplication)),
        ),
        OnboardingStage::IdentityCreation(
            IdentityCreationStage::new(services.accounts.clone(), guard(&breakers.accounts))
                .with_timeout(timeouts.timeout_for(StageKind::IdentityCreation)),
        ),
        OnboardingStage::DomainRegistration(
            DomainRegistrationStage::new(services.registry.clone(), guard(&breakers.registry))
                .with_timeout(timeouts.timeout_for(StageKind::DomainRegistration)),
        ),
        OnboardingStage::OrganizationLinkage(
            OrganizationLinkageStage::new(services.linkage.clone(), guard(&breakers.linkage))
                .with_timeout(timeouts.timeout_for(StageKind::OrganizationLinkage)),
        ),
        OnboardingStage::AgentAssignment(
            AgentAssignmentStage::new(services.linkage.clone(), guard(&breakers.linkage))
                .with_timeout(timeouts.timeout_for(StageKind::AgentAssignment)),
        ),
    ];

    stages
        .into_iter()
        .fold(Pipeline::new(metrics), |pipeline, stage| {
            pipeline.add_stage(Arc::new(stage))
        })
}
