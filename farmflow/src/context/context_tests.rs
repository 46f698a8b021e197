//! Tests for the processing context.

#[cfg(test)]
mod tests {
    use crate::cancellation::CancellationToken;
    use crate::context::{
        DedupAction, DeduplicationResult, IdentityResult, ProcessingContext, ResumeState,
        StageKind,
    };
    use crate::core::{DedupPolicy, FarmerRecord};
    use crate::errors::ErrorCode;
    use std::sync::Arc;
    use uuid::Uuid;

    fn context() -> ProcessingContext {
        ProcessingContext::new(
            Uuid::new_v4(),
            "org-1",
            "admin-1",
            4,
            FarmerRecord::new("Ravi", "Kumar", "9876543210"),
        )
    }

    #[test]
    fn test_context_defaults() {
        let ctx = context();
        assert_eq!(ctx.org_id(), "org-1");
        assert_eq!(ctx.user_id(), "admin-1");
        assert_eq!(ctx.record_index(), 4);
        assert_eq!(ctx.dedup_policy(), DedupPolicy::Skip);
        assert!(ctx.agent_id().is_none());
        assert!(ctx.resume().is_empty());
        assert!(ctx.results().recorded().is_empty());
        assert!(!ctx.cancellation().is_cancelled());
    }

    #[test]
    fn test_blank_agent_id_is_ignored() {
        let ctx = context().with_agent_id(Some("  ".to_string()));
        assert!(ctx.agent_id().is_none());

        let ctx = context().with_agent_id(Some("agent-7".to_string()));
        assert_eq!(ctx.agent_id(), Some("agent-7"));
    }

    #[test]
    fn test_require_missing_result_is_defect() {
        let ctx = context();
        let err = ctx.require_identity(StageKind::DomainRegistration).unwrap_err();

        assert_eq!(err.code, ErrorCode::MissingStageResult);
        assert!(!err.retryable);
        assert!(err.message.contains("domain_registration"));
        assert!(err.message.contains("identity_creation"));
    }

    #[test]
    fn test_typed_setters_and_accessors() {
        let mut ctx = context();
        ctx.set_deduplication(DeduplicationResult {
            action: DedupAction::New,
            existing_farmer_id: None,
        });
        ctx.set_identity(IdentityResult {
            user_id: "user-9".into(),
            username: "9876543210".into(),
            user_existed: false,
            password_generated: true,
        });

        let identity = ctx.require_identity(StageKind::DomainRegistration).unwrap();
        assert_eq!(identity.user_id, "user-9");
        assert!(!ctx
            .require_deduplication(StageKind::DomainRegistration)
            .unwrap()
            .is_duplicate());
        assert_eq!(
            ctx.results().recorded(),
            vec![StageKind::Deduplication, StageKind::IdentityCreation]
        );
    }

    #[test]
    fn test_shared_cancellation_and_resume() {
        let token = Arc::new(CancellationToken::new());
        let ctx = context()
            .with_cancellation(token.clone())
            .with_resume(ResumeState {
                identity_id: Some("user-1".into()),
                farmer_id: Some("farmer-1".into()),
            })
            .with_metadata("source_file", serde_json::json!("farmers.csv"));

        token.cancel("operator");
        assert!(ctx.cancellation().is_cancelled());
        assert_eq!(ctx.resume().farmer_id.as_deref(), Some("farmer-1"));
        assert_eq!(ctx.metadata["source_file"], "farmers.csv");
    }
}
