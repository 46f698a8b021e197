//! Optional field agent assignment.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::guard::DependencyGuard;
use super::ports::LinkageService;
use super::{Stage, StageFlow};
use crate::context::{AgentAssignmentResult, ProcessingContext, StageKind};
use crate::core::FarmerRecord;
use crate::errors::StageError;

/// Skip reason recorded when the batch names no agent.
pub const NO_AGENT_REASON: &str = "no agent specified";

/// Assigns the batch's field agent to the farmer.
///
/// The only stage whose dependency failure does not fail the record: the
/// error is logged, recorded in the context and the record still succeeds.
/// A deadline overrun is one more such failure, so the stage enforces its
/// own deadline and reports none to the executor.
#[derive(Clone)]
pub struct AgentAssignmentStage {
    linkage: Arc<dyn LinkageService>,
    guard: DependencyGuard,
    deadline: Duration,
}

impl std::fmt::Debug for AgentAssignmentStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentAssignmentStage")
            .field("breaker", &self.guard.breaker().name())
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl AgentAssignmentStage {
    /// Creates a new agent assignment stage.
    #[must_use]
    pub fn new(linkage: Arc<dyn LinkageService>, guard: DependencyGuard) -> Self {
        Self {
            linkage,
            guard,
            deadline: Duration::ZERO,
        }
    }

    /// Sets the deadline for the assignment call. Zero means none.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = timeout;
        self
    }

    /// Returns the deadline for the assignment call.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

#[async_trait]
impl Stage for AgentAssignmentStage {
    fn name(&self) -> &str {
        StageKind::AgentAssignment.as_str()
    }

    fn can_retry(&self) -> bool {
        false
    }

    fn timeout(&self) -> Duration {
        Duration::ZERO
    }

    async fn process(
        &self,
        ctx: &mut ProcessingContext,
        record: FarmerRecord,
    ) -> Result<StageFlow, StageError> {
        let Some(agent_id) = ctx.agent_id().map(str::to_string) else {
            ctx.set_agent_assignment(AgentAssignmentResult::skipped(NO_AGENT_REASON));
            return Ok(StageFlow::Skipped {
                record,
                reason: NO_AGENT_REASON.to_string(),
            });
        };
        let identity_id = ctx
            .require_identity(StageKind::AgentAssignment)?
            .user_id
            .clone();
        let org_id = ctx.org_id().to_string();

        let linkage = &self.linkage;
        let (identity, org, agent) = (identity_id.as_str(), org_id.as_str(), agent_id.as_str());
        let call = self.guard.call(ctx.cancellation(), "assign_agent", || {
            linkage.assign_agent(identity, org, agent)
        });
        let assigned = if self.deadline.is_zero() {
            call.await
        } else {
            tokio::time::timeout(self.deadline, call)
                .await
                .unwrap_or_else(|_| Err(StageError::timeout(self.name(), self.deadline)))
        };

        match assigned {
            Ok(()) => ctx.set_agent_assignment(AgentAssignmentResult::assigned(&agent_id)),
            Err(err) => {
                warn!(
                    operation_id = %ctx.operation_id(),
                    record_index = ctx.record_index(),
                    agent_id = %agent_id,
                    error = %err,
                    "agent assignment failed, continuing"
                );
                ctx.metadata.insert(
                    "agent_assignment_error".to_string(),
                    serde_json::Value::String(err.message.clone()),
                );
                ctx.set_agent_assignment(AgentAssignmentResult::failed(&agent_id, err.message));
            }
        }
        Ok(StageFlow::Continue(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::IdentityResult;
    use crate::core::StageStatus;
    use crate::errors::ServiceError;
    use crate::pipeline::{BackoffConfig, CircuitBreaker, CircuitBreakerConfig};
    use crate::stages::ports::MockLinkageService;
    use crate::testing::{FakeCall, FakeLinkageService, FaultPlan};
    use mockall::predicate::eq;
    use uuid::Uuid;

    fn stage(linkage: MockLinkageService) -> AgentAssignmentStage {
        AgentAssignmentStage::new(
            Arc::new(linkage),
            DependencyGuard::new(
                Arc::new(CircuitBreaker::new("linkage", CircuitBreakerConfig::default())),
                BackoffConfig::new().with_initial_delay_ms(1).with_jitter(false),
            ),
        )
    }

    fn record() -> FarmerRecord {
        FarmerRecord::new("Ravi", "Kumar", "9876543210")
    }

    fn ctx(agent: Option<&str>) -> ProcessingContext {
        let mut ctx = ProcessingContext::new(Uuid::new_v4(), "org-1", "admin", 0, record())
            .with_agent_id(agent.map(str::to_string));
        ctx.set_identity(IdentityResult {
            user_id: "user-1".into(),
            username: "9876543210".into(),
            user_existed: false,
            password_generated: true,
        });
        ctx
    }

    #[tokio::test]
    async fn test_no_agent_skips_stage() {
        let mut linkage = MockLinkageService::new();
        linkage.expect_assign_agent().never();

        let mut ctx = ctx(None);
        let flow = stage(linkage).process(&mut ctx, record()).await.unwrap();

        match flow {
            StageFlow::Skipped { reason, .. } => assert_eq!(reason, NO_AGENT_REASON),
            other => panic!("expected stage skip, got {other:?}"),
        }
        let result = ctx.results().agent_assignment.clone().unwrap();
        assert_eq!(result.status, StageStatus::Skip);
        assert_eq!(result.reason.as_deref(), Some(NO_AGENT_REASON));
    }

    #[tokio::test]
    async fn test_assigns_agent() {
        let mut linkage = MockLinkageService::new();
        linkage
            .expect_assign_agent()
            .with(eq("user-1"), eq("org-1"), eq("agent-7"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut ctx = ctx(Some("agent-7"));
        let flow = stage(linkage).process(&mut ctx, record()).await.unwrap();

        assert!(matches!(flow, StageFlow::Continue(_)));
        let result = ctx.results().agent_assignment.clone().unwrap();
        assert_eq!(result.status, StageStatus::Ok);
        assert_eq!(result.agent_id.as_deref(), Some("agent-7"));
    }

    #[tokio::test]
    async fn test_failure_is_downgraded() {
        let mut linkage = MockLinkageService::new();
        linkage
            .expect_assign_agent()
            .returning(|_, _, _| Err(ServiceError::rejected(404, "agent not in org")));

        let mut ctx = ctx(Some("agent-7"));
        let flow = stage(linkage).process(&mut ctx, record()).await.unwrap();

        assert!(matches!(flow, StageFlow::Continue(_)));
        let result = ctx.results().agent_assignment.clone().unwrap();
        assert_eq!(result.status, StageStatus::Fail);
        assert!(result.error.unwrap().contains("agent not in org"));
        assert!(ctx.metadata.contains_key("agent_assignment_error"));
    }

    #[tokio::test]
    async fn test_deadline_overrun_is_downgraded() {
        let faults = Arc::new(FaultPlan::default());
        faults.delay(FakeCall::AssignAgent, Duration::from_millis(300));
        let stage = AgentAssignmentStage::new(
            Arc::new(FakeLinkageService::new(faults.clone())),
            DependencyGuard::new(
                Arc::new(CircuitBreaker::new("linkage", CircuitBreakerConfig::default())),
                BackoffConfig::new().with_initial_delay_ms(1).with_jitter(false),
            ),
        )
        .with_timeout(Duration::from_millis(20));

        let mut ctx = ctx(Some("agent-7"));
        let flow = stage.process(&mut ctx, record()).await.unwrap();

        assert!(matches!(flow, StageFlow::Continue(_)));
        let result = ctx.results().agent_assignment.clone().unwrap();
        assert_eq!(result.status, StageStatus::Fail);
        assert!(result.error.unwrap().contains("timeout after 20ms"));
        assert!(ctx.metadata.contains_key("agent_assignment_error"));
        assert_eq!(faults.calls(FakeCall::AssignAgent), 1);
    }

    #[test]
    fn test_deadline_is_not_reported_to_executor() {
        let stage = stage(MockLinkageService::new()).with_timeout(Duration::from_secs(15));
        assert_eq!(stage.timeout(), Duration::ZERO);
        assert_eq!(stage.deadline(), Duration::from_secs(15));
    }
}
