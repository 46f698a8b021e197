//! End-to-end tests for batch processing with in-memory collaborators.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::*;
use crate::config::OnboardingConfig;
use crate::context::DedupAction;
use crate::core::{DetailStatus, FarmerRecord, OperationStatus, StageStatus};
use crate::errors::{BatchError, ErrorCode, ServiceError, StoreError};
use crate::events::{BulkEvent, CollectingEventSink};
use crate::pipeline::{BackoffConfig, CircuitBreakerConfig, CircuitState};
use crate::stages::ports::FarmerProfile;
use crate::stages::NO_AGENT_REASON;
use crate::testing::{sample_record, sample_records, short_phone_record, FakeCall, FakeServices};

const ORG: &str = "org-1";
const ADMIN: &str = "admin-1";

fn fast_retry() -> BackoffConfig {
    BackoffConfig::new()
        .with_initial_delay_ms(1)
        .with_max_delay_ms(5)
        .with_jitter(false)
}

fn config() -> OnboardingConfig {
    OnboardingConfig::new()
        .with_worker_count(4)
        .with_retry(fast_retry())
}

fn coordinator(fakes: &FakeServices, config: OnboardingConfig) -> BatchCoordinator {
    BatchCoordinator::new(fakes.services(), config)
}

async fn run(coordinator: &BatchCoordinator, records: Vec<FarmerRecord>) -> BulkOperation {
    run_with(coordinator, records, BatchOptions::new()).await
}

async fn run_with(
    coordinator: &BatchCoordinator,
    records: Vec<FarmerRecord>,
    options: BatchOptions,
) -> BulkOperation {
    let id = coordinator
        .submit(ORG, ADMIN, records, options)
        .await
        .unwrap();
    coordinator.wait(id).await.unwrap()
}

fn assert_counters(op: &BulkOperation) {
    assert_eq!(op.processed, op.successful + op.failed + op.skipped);
    assert!(op.processed <= op.total);
}

#[tokio::test]
async fn test_valid_records_complete_without_agent() {
    let fakes = FakeServices::new();
    let coordinator = coordinator(&fakes, config());

    let op = run(&coordinator, sample_records(3)).await;

    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!((op.successful, op.failed, op.skipped), (3, 0, 0));
    assert!(op.processing_duration_ms.is_some());
    assert_counters(&op);

    for detail in coordinator.details(op.id).await.unwrap() {
        assert_eq!(detail.status, DetailStatus::Success);
        let agent = detail.results.agent_assignment.unwrap();
        assert_eq!(agent.status, StageStatus::Skip);
        assert_eq!(agent.reason.as_deref(), Some(NO_AGENT_REASON));
        assert!(detail.farmer_id.is_some());
    }
    assert_eq!(fakes.accounts.count(), 3);
    assert_eq!(fakes.registry.count(), 3);
    assert_eq!(fakes.linkage.link_count(), 3);
}

#[tokio::test]
async fn test_invalid_phone_fails_only_that_record() {
    let fakes = FakeServices::new();
    let coordinator = coordinator(&fakes, config());

    let op = run(&coordinator, vec![sample_record(0), short_phone_record()]).await;

    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!((op.successful, op.failed), (1, 1));

    let failed = coordinator.failed_records(op.id).await.unwrap();
    assert_eq!(failed.len(), 1);
    let detail = &failed[0];
    assert_eq!(detail.record_index, 1);
    assert_eq!(detail.error_code, Some(ErrorCode::ValidationFailed));
    assert!(detail.error_message.as_deref().unwrap().contains("phone number format"));
    assert!(!detail.retryable);
    assert_eq!(detail.retry_count, 0);

    let summary = coordinator.retry_failed(op.id).await.unwrap();
    assert_eq!(summary.retried, 0);
    let detail = &coordinator.failed_records(op.id).await.unwrap()[0];
    assert_eq!(detail.retry_count, 0);
}

#[tokio::test]
async fn test_transient_identity_failures_retried_inside_stage() {
    let fakes = FakeServices::new();
    fakes
        .faults
        .fail_next(FakeCall::CreateAccount, ServiceError::transient("connection reset"), 2);
    let coordinator = coordinator(&fakes, config());

    let op = run(&coordinator, vec![sample_record(0)]).await;

    assert_eq!(op.successful, 1);
    assert_eq!(fakes.faults.calls(FakeCall::CreateAccount), 3);
    assert_eq!(fakes.accounts.count(), 1);

    // The pipeline invoked the stage once; the attempts happened inside it.
    let identity = coordinator.metrics()["identity_creation"].clone();
    assert_eq!(identity.executions, 1);
    assert_eq!(identity.successes, 1);
    assert_eq!(identity.failures, 0);
}

#[tokio::test]
async fn test_exhausted_identity_recovered_by_retry_pass() {
    let fakes = FakeServices::new();
    fakes
        .faults
        .fail_next(FakeCall::CreateAccount, ServiceError::transient("connection reset"), 2);
    let coordinator = coordinator(
        &fakes,
        config().with_retry(fast_retry().with_max_attempts(2)),
    );

    let op = run(&coordinator, vec![sample_record(0)]).await;
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.failed, 1);

    let failed = coordinator.failed_records(op.id).await.unwrap();
    assert_eq!(failed[0].stage.as_deref(), Some("identity_creation"));
    assert_eq!(failed[0].error_code, Some(ErrorCode::DependencyUnavailable));
    assert!(failed[0].retryable);

    let summary = coordinator.retry_failed(op.id).await.unwrap();
    assert_eq!((summary.retried, summary.recovered, summary.still_failed), (1, 1, 0));
    assert_eq!(summary.operation.status, OperationStatus::Completed);
    assert_eq!((summary.operation.successful, summary.operation.failed), (1, 0));
    assert_eq!(summary.operation.processed, 1);
    assert_counters(&summary.operation);

    let detail = &coordinator.details(op.id).await.unwrap()[0];
    assert_eq!(detail.status, DetailStatus::Success);
    assert_eq!(detail.retry_count, 1);
    assert!(detail.error_code.is_none());

    let identity = coordinator.metrics()["identity_creation"].clone();
    assert_eq!((identity.successes, identity.failures), (1, 1));
    assert_eq!(fakes.faults.calls(FakeCall::CreateAccount), 3);
}

#[tokio::test]
async fn test_retry_reuses_identity_and_farmer() {
    let fakes = FakeServices::new();
    fakes
        .faults
        .fail_always(FakeCall::LinkFarmer, ServiceError::transient("service unavailable"));
    let coordinator = coordinator(
        &fakes,
        config().with_retry(fast_retry().with_max_attempts(1)),
    );

    let op = run(&coordinator, sample_records(2)).await;
    assert_eq!(op.failed, 2);
    assert_eq!(fakes.accounts.count(), 2);
    assert_eq!(fakes.registry.count(), 2);
    for detail in coordinator.failed_records(op.id).await.unwrap() {
        assert_eq!(detail.stage.as_deref(), Some("organization_linkage"));
        assert!(detail.identity_id.is_some());
        assert!(detail.farmer_id.is_some());
    }

    fakes.faults.clear(FakeCall::LinkFarmer);
    let summary = coordinator.retry_failed(op.id).await.unwrap();

    assert_eq!(summary.recovered, 2);
    assert_eq!(fakes.accounts.count(), 2);
    assert_eq!(fakes.registry.count(), 2);
    assert_eq!(fakes.linkage.link_count(), 2);
    for detail in coordinator.details(op.id).await.unwrap() {
        assert_eq!(detail.status, DetailStatus::Success);
        assert_eq!(
            detail.results.deduplication.unwrap().action,
            DedupAction::Resume
        );
        assert!(detail.results.identity.unwrap().user_existed);
        assert!(detail.results.registration.unwrap().reused_existing);
    }
}

#[tokio::test]
async fn test_retry_stops_at_ceiling() {
    let fakes = FakeServices::new();
    fakes
        .faults
        .fail_always(FakeCall::CreateAccount, ServiceError::transient("temporary outage"));
    let coordinator = coordinator(
        &fakes,
        config()
            .with_max_retries(1)
            .with_retry(fast_retry().with_max_attempts(1)),
    );

    let op = run(&coordinator, vec![sample_record(0)]).await;
    assert_eq!(op.failed, 1);

    let first = coordinator.retry_failed(op.id).await.unwrap();
    assert_eq!((first.retried, first.still_failed), (1, 1));

    let second = coordinator.retry_failed(op.id).await.unwrap();
    assert_eq!(second.retried, 0);
    assert_eq!(second.operation.failed, 1);

    let detail = &coordinator.failed_records(op.id).await.unwrap()[0];
    assert_eq!(detail.retry_count, 1);
}

#[tokio::test]
async fn test_large_batch_keeps_index_order_and_counts() {
    let fakes = FakeServices::new();
    let events = Arc::new(CollectingEventSink::new());
    let coordinator = BatchCoordinator::builder(
        fakes.services(),
        config().with_worker_count(8).with_detail_flush_size(7),
    )
    .with_event_sink(events.clone())
    .build();

    let op = run(&coordinator, sample_records(50)).await;

    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.successful, 50);
    assert_counters(&op);

    let details = coordinator.details(op.id).await.unwrap();
    let indices: Vec<usize> = details.iter().map(|d| d.record_index).collect();
    assert_eq!(indices, (0..50).collect::<Vec<_>>());
    assert!(details.iter().all(|d| d.status == DetailStatus::Success));

    assert_eq!(events.events_of_type("bulk.started").len(), 1);
    assert_eq!(events.events_of_type("bulk.record_completed").len(), 50);
    assert_eq!(events.events_of_type("bulk.completed").len(), 1);
    assert_eq!(coordinator.metrics()["validation"].executions, 50);
}

#[tokio::test]
async fn test_cancel_stops_dispatch_and_leaves_rest_pending() {
    let fakes = FakeServices::new();
    fakes
        .faults
        .delay(FakeCall::CreateAccount, Duration::from_millis(300));
    let events = Arc::new(CollectingEventSink::new());
    let coordinator = BatchCoordinator::builder(fakes.services(), config().with_worker_count(2))
        .with_event_sink(events.clone())
        .build();

    let id = coordinator
        .submit(ORG, ADMIN, sample_records(10), BatchOptions::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(coordinator.is_running(id));
    coordinator.cancel(id, "operator stop").await.unwrap();

    let op = coordinator.wait(id).await.unwrap();
    assert_eq!(op.status, OperationStatus::Cancelled);
    assert_eq!(op.error_message.as_deref(), Some("operator stop"));
    assert!(op.processed <= 2);
    assert_eq!(op.processed, op.failed);
    assert_counters(&op);

    let details = coordinator.details(id).await.unwrap();
    let pending = details
        .iter()
        .filter(|d| d.status == DetailStatus::Pending)
        .count();
    assert_eq!(pending, 10 - op.processed);
    for detail in details.iter().filter(|d| d.status == DetailStatus::Failed) {
        assert_eq!(detail.error_code, Some(ErrorCode::Cancelled));
        assert!(detail.retryable);
    }
    assert_eq!(events.events_of_type("bulk.cancelled").len(), 1);
    assert!(events.events_of_type("bulk.completed").is_empty());

    let err = coordinator.cancel(id, "again").await.unwrap_err();
    assert!(matches!(err, BatchError::NotRunning(_)));
}

#[tokio::test]
async fn test_retry_rejected_while_running() {
    let fakes = FakeServices::new();
    fakes
        .faults
        .delay(FakeCall::CreateAccount, Duration::from_millis(100));
    let coordinator = coordinator(&fakes, config());

    let id = coordinator
        .submit(ORG, ADMIN, sample_records(2), BatchOptions::new())
        .await
        .unwrap();

    let err = coordinator.retry_failed(id).await.unwrap_err();
    assert!(matches!(err, BatchError::StillRunning(_)));
    let err = coordinator.delete_operation(id).await.unwrap_err();
    assert!(matches!(err, BatchError::StillRunning(_)));

    let op = coordinator.wait(id).await.unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
}

#[derive(Debug, Default)]
struct BrokenDetailStore {
    inner: InMemoryProcessingDetailStore,
}

#[async_trait]
impl ProcessingDetailStore for BrokenDetailStore {
    async fn insert_batch(&self, details: Vec<ProcessingDetail>) -> Result<usize, StoreError> {
        self.inner.insert_batch(details).await
    }

    async fn update(&self, _detail: ProcessingDetail) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }

    async fn update_batch(&self, _details: Vec<ProcessingDetail>) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }

    async fn get(
        &self,
        operation_id: Uuid,
        record_index: usize,
    ) -> Result<ProcessingDetail, StoreError> {
        self.inner.get(operation_id, record_index).await
    }

    async fn list(&self, operation_id: Uuid) -> Result<Vec<ProcessingDetail>, StoreError> {
        self.inner.list(operation_id).await
    }

    async fn list_by_status(
        &self,
        operation_id: Uuid,
        status: DetailStatus,
    ) -> Result<Vec<ProcessingDetail>, StoreError> {
        self.inner.list_by_status(operation_id, status).await
    }

    async fn list_retryable(
        &self,
        operation_id: Uuid,
        max_retries: u32,
    ) -> Result<Vec<ProcessingDetail>, StoreError> {
        self.inner.list_retryable(operation_id, max_retries).await
    }
}

#[tokio::test]
async fn test_detail_store_failure_fails_operation() {
    let fakes = FakeServices::new();
    let events = Arc::new(CollectingEventSink::new());
    let coordinator = BatchCoordinator::builder(fakes.services(), config())
        .with_detail_store(Arc::new(BrokenDetailStore::default()))
        .with_event_sink(events.clone())
        .build();

    let op = run(&coordinator, sample_records(5)).await;

    assert_eq!(op.status, OperationStatus::Failed);
    assert!(op
        .error_message
        .as_deref()
        .unwrap()
        .contains("detail store unavailable"));
    assert_eq!(op.processed, 0);
    assert_eq!(events.events_of_type("bulk.failed").len(), 1);
}

#[tokio::test]
async fn test_duplicate_is_skipped() {
    let fakes = FakeServices::new();
    let existing = sample_record(1);
    fakes.registry.seed(FarmerProfile::from_record(&existing, "user-existing", ORG));
    let coordinator = coordinator(&fakes, config());

    let op = run(&coordinator, sample_records(3)).await;

    assert_eq!((op.successful, op.skipped), (2, 1));
    let summary = coordinator.results_summary(op.id).await.unwrap();
    let skipped: Vec<_> = summary.records_with_status(DetailStatus::Skipped).collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].record_index, 1);
    assert_eq!(skipped[0].stage.as_deref(), Some("deduplication"));
    assert!(skipped[0].message.as_deref().unwrap().starts_with("duplicate"));
    assert_eq!(fakes.accounts.count(), 2);
}

#[tokio::test]
async fn test_agent_assigned_to_every_farmer() {
    let fakes = FakeServices::new();
    let coordinator = coordinator(&fakes, config());

    let op = run_with(
        &coordinator,
        sample_records(2),
        BatchOptions::new().with_agent_id("agent-7"),
    )
    .await;

    assert_eq!(op.successful, 2);
    let assignments = fakes.linkage.assignments();
    assert_eq!(assignments.len(), 2);
    assert!(assignments.iter().all(|(_, org, agent)| org == ORG && agent == "agent-7"));
    for detail in coordinator.details(op.id).await.unwrap() {
        assert_eq!(detail.results.agent_assignment.unwrap().status, StageStatus::Ok);
    }
}

#[tokio::test]
async fn test_agent_failure_does_not_fail_record() {
    let fakes = FakeServices::new();
    fakes
        .faults
        .fail_always(FakeCall::AssignAgent, ServiceError::rejected(403, "agent not in org"));
    let coordinator = coordinator(&fakes, config());

    let op = run_with(
        &coordinator,
        vec![sample_record(0)],
        BatchOptions::new().with_agent_id("agent-7"),
    )
    .await;

    assert_eq!(op.successful, 1);
    let detail = &coordinator.details(op.id).await.unwrap()[0];
    let agent = detail.results.agent_assignment.clone().unwrap();
    assert_eq!(agent.status, StageStatus::Fail);
    assert!(agent.error.unwrap().contains("agent not in org"));
}

#[tokio::test]
async fn test_listing_and_soft_delete() {
    let fakes = FakeServices::new();
    let coordinator = coordinator(&fakes, config());

    let first = run(&coordinator, vec![sample_record(0)]).await;
    let second = run(&coordinator, vec![sample_record(1)]).await;
    let other = coordinator
        .submit("org-2", ADMIN, vec![sample_record(2)], BatchOptions::new())
        .await
        .unwrap();
    coordinator.wait(other).await.unwrap();

    let listed = coordinator.list_operations(ORG).await.unwrap();
    assert_eq!(listed.len(), 2);

    coordinator.delete_operation(first.id).await.unwrap();
    let listed = coordinator.list_operations(ORG).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, second.id);
    assert!(coordinator.status(first.id).await.unwrap().is_deleted());
}

#[tokio::test]
async fn test_rejects_empty_and_unknown() {
    let coordinator = coordinator(&FakeServices::new(), config());

    let err = coordinator
        .submit(ORG, ADMIN, Vec::new(), BatchOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::EmptyBatch));

    let err = coordinator.status(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(
        err,
        BatchError::Store(StoreError::OperationNotFound(_))
    ));
    let err = coordinator.cancel(Uuid::new_v4(), "stop").await.unwrap_err();
    assert!(matches!(
        err,
        BatchError::Store(StoreError::OperationNotFound(_))
    ));
}

#[tokio::test]
async fn test_summary_reports_every_record() {
    let fakes = FakeServices::new();
    let coordinator = coordinator(&fakes, config());

    let id = coordinator
        .submit(
            ORG,
            ADMIN,
            vec![sample_record(0), short_phone_record(), sample_record(2)],
            BatchOptions::new().with_source_file("farmers.csv"),
        )
        .await
        .unwrap();
    coordinator.wait(id).await.unwrap();

    let summary = coordinator.results_summary(id).await.unwrap();
    assert_eq!(summary.records.len(), 3);
    assert_eq!(summary.source_file.as_deref(), Some("farmers.csv"));
    assert_eq!((summary.successful, summary.failed), (2, 1));
    assert_eq!(summary.records[1].status, DetailStatus::Failed);
    assert_eq!(summary.records[1].phone_number, "987654321");
}

#[tokio::test]
async fn test_agent_timeout_does_not_fail_record() {
    let fakes = FakeServices::new();
    fakes
        .faults
        .delay(FakeCall::AssignAgent, Duration::from_millis(300));
    let mut config = config();
    config.stage_timeouts.agent_assignment_ms = 20;
    let coordinator = coordinator(&fakes, config);

    let op = run_with(
        &coordinator,
        vec![sample_record(0)],
        BatchOptions::new().with_agent_id("agent-7"),
    )
    .await;

    assert_eq!((op.successful, op.failed), (1, 0));
    let detail = &coordinator.details(op.id).await.unwrap()[0];
    assert_eq!(detail.status, DetailStatus::Success);
    assert!(detail.error_code.is_none());
    let agent = detail.results.agent_assignment.clone().unwrap();
    assert_eq!(agent.status, StageStatus::Fail);
    assert!(agent.error.unwrap().contains("timeout after 20ms"));
    assert_eq!(fakes.linkage.link_count(), 1);
}

#[tokio::test]
async fn test_open_breaker_short_circuits_remaining_records() {
    let fakes = FakeServices::new();
    fakes
        .faults
        .fail_always(FakeCall::CreateAccount, ServiceError::transient("service unavailable"));
    let coordinator = coordinator(
        &fakes,
        config()
            .with_worker_count(1)
            .with_retry(fast_retry().with_max_attempts(1))
            .with_circuit_breaker(CircuitBreakerConfig::new(1, Duration::from_secs(60))),
    );

    let op = run(&coordinator, sample_records(4)).await;

    assert_eq!(op.failed, 4);
    assert_eq!(fakes.faults.calls(FakeCall::CreateAccount), 1);
    assert_eq!(coordinator.breakers().accounts.state(), CircuitState::Open);

    let details = coordinator.details(op.id).await.unwrap();
    assert_eq!(details[0].error_code, Some(ErrorCode::DependencyUnavailable));
    for detail in &details[1..] {
        assert_eq!(detail.error_code, Some(ErrorCode::CircuitOpen));
        assert!(detail.retryable);
    }
    assert_eq!(fakes.accounts.count(), 0);
}

#[tokio::test]
async fn test_hanging_dependency_opens_breaker() {
    let fakes = FakeServices::new();
    fakes
        .faults
        .delay(FakeCall::CreateAccount, Duration::from_millis(500));
    let mut config = config()
        .with_worker_count(1)
        .with_circuit_breaker(CircuitBreakerConfig::new(1, Duration::from_secs(60)));
    config.stage_timeouts.identity_creation_ms = 20;
    let coordinator = coordinator(&fakes, config);

    let op = run(&coordinator, sample_records(3)).await;

    assert_eq!(op.failed, 3);
    assert_eq!(fakes.faults.calls(FakeCall::CreateAccount), 1);
    assert_eq!(coordinator.breakers().accounts.state(), CircuitState::Open);

    let details = coordinator.details(op.id).await.unwrap();
    assert_eq!(details[0].error_code, Some(ErrorCode::Timeout));
    assert_eq!(details[1].error_code, Some(ErrorCode::CircuitOpen));
    assert_eq!(details[2].error_code, Some(ErrorCode::CircuitOpen));
}

#[tokio::test]
async fn test_out_of_order_completions_keep_index_order() {
    let fakes = FakeServices::new();
    let records = sample_records(12);
    for (index, record) in records.iter().enumerate() {
        let latency = Duration::from_millis(15 * (12 - index as u64));
        fakes
            .faults
            .delay_for(FakeCall::CreateAccount, record.phone_number.clone(), latency);
    }
    let events = Arc::new(CollectingEventSink::new());
    let coordinator = BatchCoordinator::builder(
        fakes.services(),
        config().with_worker_count(4).with_detail_flush_size(1),
    )
    .with_event_sink(events.clone())
    .build();

    let op = run(&coordinator, records.clone()).await;
    assert_eq!(op.successful, 12);
    assert_counters(&op);

    let completed: Vec<usize> = events
        .events_of_type("bulk.record_completed")
        .into_iter()
        .filter_map(|event| match event {
            BulkEvent::RecordCompleted { record_index, .. } => Some(record_index),
            _ => None,
        })
        .collect();
    assert_eq!(completed.len(), 12);
    assert_ne!(completed, (0..12).collect::<Vec<_>>());

    let details = coordinator.details(op.id).await.unwrap();
    let indices: Vec<usize> = details.iter().map(|d| d.record_index).collect();
    assert_eq!(indices, (0..12).collect::<Vec<_>>());
    for (detail, record) in details.iter().zip(&records) {
        assert_eq!(detail.status, DetailStatus::Success);
        assert_eq!(detail.record.phone_number, record.phone_number);
    }
}

fn linkage_outage_config(workers: usize) -> OnboardingConfig {
    config()
        .with_worker_count(workers)
        .with_retry(fast_retry().with_max_attempts(1))
        .with_circuit_breaker(CircuitBreakerConfig::new(100, Duration::from_secs(60)))
}

async fn fail_at_linkage(
    fakes: &FakeServices,
    coordinator: &BatchCoordinator,
    records: usize,
) -> Uuid {
    fakes
        .faults
        .fail_always(FakeCall::LinkFarmer, ServiceError::transient("service unavailable"));
    let op = run(coordinator, sample_records(records)).await;
    assert_eq!(op.failed, records);
    fakes.faults.clear(FakeCall::LinkFarmer);
    op.id
}

#[tokio::test]
async fn test_cancelled_retry_pass_keeps_budget_of_undispatched_records() {
    let fakes = FakeServices::new();
    let coordinator = coordinator(&fakes, linkage_outage_config(2));
    let id = fail_at_linkage(&fakes, &coordinator, 6).await;

    fakes
        .faults
        .delay(FakeCall::LinkFarmer, Duration::from_millis(300));
    let pass = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.retry_failed(id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    coordinator.cancel(id, "operator stop").await.unwrap();
    let summary = pass.await.unwrap().unwrap();
    assert_eq!(summary.recovered, 0);

    let details = coordinator.details(id).await.unwrap();
    assert!(details.iter().all(|d| d.status == DetailStatus::Failed));
    let attempted = details.iter().filter(|d| d.retry_count == 1).count();
    let untouched = details.iter().filter(|d| d.retry_count == 0).count();
    assert!(attempted <= 2, "attempted {attempted}");
    assert_eq!(attempted + untouched, 6);
    for detail in details.iter().filter(|d| d.retry_count == 0) {
        assert_eq!(detail.error_code, Some(ErrorCode::DependencyUnavailable));
        assert!(detail.is_retry_eligible(3));
    }
}

#[tokio::test]
async fn test_retry_pass_outlives_dropped_caller() {
    let fakes = FakeServices::new();
    let coordinator = coordinator(&fakes, linkage_outage_config(1));
    let id = fail_at_linkage(&fakes, &coordinator, 1).await;

    fakes
        .faults
        .delay(FakeCall::LinkFarmer, Duration::from_millis(200));
    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), coordinator.retry_failed(id)).await;
    assert!(abandoned.is_err());

    assert!(coordinator.is_running(id));
    let err = coordinator.retry_failed(id).await.unwrap_err();
    assert!(matches!(err, BatchError::StillRunning(_)));

    let op = coordinator.wait(id).await.unwrap();
    assert!(!coordinator.is_running(id));
    assert_eq!((op.successful, op.failed), (1, 0));
    let detail = &coordinator.details(id).await.unwrap()[0];
    assert_eq!(detail.status, DetailStatus::Success);
    assert_eq!(detail.retry_count, 1);
}
