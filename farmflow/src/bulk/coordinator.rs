//! Batch coordinator: fans records out over a bounded worker pool and folds
//! the outcomes into the operation lifecycle and the detail store.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::detail::ProcessingDetail;
use super::operation::{BatchOptions, BulkOperation};
use super::store::{
    BulkOperationStore, InMemoryBulkOperationStore, InMemoryProcessingDetailStore,
    ProcessingDetailStore,
};
use super::summary::ResultsSummary;
use crate::cancellation::CancellationToken;
use crate::config::OnboardingConfig;
use crate::context::ProcessingContext;
use crate::core::{DetailStatus, FarmerRecord, OperationStatus};
use crate::errors::{BatchError, StoreError};
use crate::events::{BulkEvent, EventSink, NoOpEventSink};
use crate::observability::operation_span;
use crate::pipeline::{duration_ms, Pipeline, PipelineMetrics, PipelineOutcome, StageMetrics};
use crate::stages::{onboarding_pipeline, DependencyBreakers, OnboardingServices};

const STORE_UNAVAILABLE: &str = "detail store unavailable";

/// Result of an operator-triggered retry pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    /// Operation.
    pub operation_id: Uuid,
    /// Records re-run.
    pub retried: usize,
    /// Records now successful or skipped.
    pub recovered: usize,
    /// Records still failing.
    pub still_failed: usize,
    /// Operation after the pass.
    pub operation: BulkOperation,
}

/// Builder for [`BatchCoordinator`].
pub struct BatchCoordinatorBuilder {
    services: OnboardingServices,
    config: OnboardingConfig,
    operations: Option<Arc<dyn BulkOperationStore>>,
    details: Option<Arc<dyn ProcessingDetailStore>>,
    events: Option<Arc<dyn EventSink>>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl BatchCoordinatorBuilder {
    /// Starts a builder with in-memory stores and no event sink.
    #[must_use]
    pub fn new(services: OnboardingServices, config: OnboardingConfig) -> Self {
        Self {
            services,
            config,
            operations: None,
            details: None,
            events: None,
            metrics: None,
        }
    }

    /// Uses the given operation store.
    #[must_use]
    pub fn with_operation_store(mut self, store: Arc<dyn BulkOperationStore>) -> Self {
        self.operations = Some(store);
        self
    }

    /// Uses the given detail store.
    #[must_use]
    pub fn with_detail_store(mut self, store: Arc<dyn ProcessingDetailStore>) -> Self {
        self.details = Some(store);
        self
    }

    /// Emits lifecycle events to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Accumulates stage metrics into `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Wires the pipeline and builds the coordinator.
    #[must_use]
    pub fn build(self) -> BatchCoordinator {
        let metrics = self.metrics.unwrap_or_default();
        let breakers = DependencyBreakers::new(&self.config.circuit_breaker);
        let pipeline = onboarding_pipeline(&self.services, &breakers, &self.config, metrics.clone());
        BatchCoordinator {
            inner: Arc::new(Inner {
                pipeline,
                breakers,
                metrics,
                operations: self
                    .operations
                    .unwrap_or_else(|| Arc::new(InMemoryBulkOperationStore::new())),
                details: self
                    .details
                    .unwrap_or_else(|| Arc::new(InMemoryProcessingDetailStore::new())),
                events: self.events.unwrap_or_else(|| Arc::new(NoOpEventSink)),
                active: DashMap::new(),
                config: self.config,
            }),
        }
    }
}

/// Entry point for bulk onboarding.
///
/// Cheap to clone; clones share stores, metrics, breakers and the set of
/// running operations.
#[derive(Clone)]
pub struct BatchCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("workers", &self.inner.config.workers())
            .field("stages", &self.inner.pipeline.stage_names())
            .field("active", &self.inner.active.len())
            .finish()
    }
}

struct Inner {
    config: OnboardingConfig,
    pipeline: Pipeline,
    breakers: DependencyBreakers,
    metrics: Arc<PipelineMetrics>,
    operations: Arc<dyn BulkOperationStore>,
    details: Arc<dyn ProcessingDetailStore>,
    events: Arc<dyn EventSink>,
    active: DashMap<Uuid, ActiveRun>,
}

struct ActiveRun {
    token: Arc<CancellationToken>,
    done: watch::Receiver<bool>,
}

/// Deregisters a run when dropped, waking anyone in [`BatchCoordinator::wait`].
struct RunGuard {
    inner: Arc<Inner>,
    operation_id: Uuid,
    done: watch::Sender<bool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.inner.active.remove(&self.operation_id);
        let _ = self.done.send(true);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Initial,
    Retry,
}

struct Completion {
    detail: ProcessingDetail,
    previous: DetailStatus,
}

#[derive(Debug, Default)]
struct PassReport {
    written: usize,
    successful: usize,
    failed: usize,
    skipped: usize,
}

impl BatchCoordinator {
    /// Creates a coordinator with in-memory stores.
    #[must_use]
    pub fn new(services: OnboardingServices, config: OnboardingConfig) -> Self {
        BatchCoordinatorBuilder::new(services, config).build()
    }

    /// Starts a builder.
    #[must_use]
    pub fn builder(services: OnboardingServices, config: OnboardingConfig) -> BatchCoordinatorBuilder {
        BatchCoordinatorBuilder::new(services, config)
    }

    /// Submits a batch and starts processing it in the background.
    ///
    /// Records are persisted as pending details before the first one is
    /// dispatched. Returns the operation id immediately.
    pub async fn submit(
        &self,
        org_id: &str,
        user_id: &str,
        records: Vec<FarmerRecord>,
        options: BatchOptions,
    ) -> Result<Uuid, BatchError> {
        if records.is_empty() {
            return Err(BatchError::EmptyBatch);
        }

        let operation = BulkOperation::new(org_id, user_id, records.len(), options);
        let operation_id = operation.id;
        self.inner.operations.create(operation.clone()).await?;

        let pending: Vec<_> = records
            .into_iter()
            .enumerate()
            .map(|(index, record)| ProcessingDetail::pending(operation_id, index, record))
            .collect();
        self.inner.details.insert_batch(pending.clone()).await?;

        let (token, guard) = self.inner.register(operation_id)?;
        info!(
            %operation_id,
            org_id,
            total = operation.total,
            workers = self.inner.config.workers(),
            "bulk operation submitted"
        );

        let span = operation_span(operation_id, org_id, "initial");
        let inner = self.inner.clone();
        tokio::spawn(
            async move {
                inner.run_batch(operation, pending, token).await;
                drop(guard);
            }
            .instrument(span),
        );
        Ok(operation_id)
    }

    /// Current state and progress of an operation.
    pub async fn status(&self, operation_id: Uuid) -> Result<BulkOperation, BatchError> {
        Ok(self.inner.operations.get(operation_id).await?)
    }

    /// Requests cancellation of a running operation or retry pass.
    ///
    /// Dispatch stops at once and back-off waits are interrupted; records in
    /// flight stop before their next stage.
    pub async fn cancel(&self, operation_id: Uuid, reason: &str) -> Result<(), BatchError> {
        let token = self
            .inner
            .active
            .get(&operation_id)
            .map(|run| run.token.clone());
        match token {
            Some(token) => {
                if token.cancel(reason) {
                    warn!(%operation_id, reason, "bulk operation cancellation requested");
                }
                Ok(())
            }
            None => {
                self.inner.operations.get(operation_id).await?;
                Err(BatchError::NotRunning(operation_id))
            }
        }
    }

    /// Returns true while a run or retry pass is active.
    #[must_use]
    pub fn is_running(&self, operation_id: Uuid) -> bool {
        self.inner.active.contains_key(&operation_id)
    }

    /// Waits for the active run or retry pass to finish, then returns the
    /// operation.
    pub async fn wait(&self, operation_id: Uuid) -> Result<BulkOperation, BatchError> {
        let done = self
            .inner
            .active
            .get(&operation_id)
            .map(|run| run.done.clone());
        if let Some(mut done) = done {
            // A closed channel means the run guard is gone, which is also done.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.status(operation_id).await
    }

    /// Failed details ordered by record index.
    pub async fn failed_records(
        &self,
        operation_id: Uuid,
    ) -> Result<Vec<ProcessingDetail>, BatchError> {
        self.inner.operations.get(operation_id).await?;
        Ok(self
            .inner
            .details
            .list_by_status(operation_id, DetailStatus::Failed)
            .await?)
    }

    /// All details ordered by record index.
    pub async fn details(&self, operation_id: Uuid) -> Result<Vec<ProcessingDetail>, BatchError> {
        self.inner.operations.get(operation_id).await?;
        Ok(self.inner.details.list(operation_id).await?)
    }

    /// Re-runs the full pipeline for retryable failures below the retry
    /// ceiling and waits for the pass to finish.
    ///
    /// Each record's retry count is incremented as it is dispatched, so rows
    /// left behind by a cancelled pass keep their budget. Counters of the
    /// (terminal) operation are adjusted in place. With nothing eligible this
    /// is a no-op.
    ///
    /// The pass runs on its own task and stays registered until it ends, even
    /// if the caller stops waiting.
    pub async fn retry_failed(&self, operation_id: Uuid) -> Result<RetrySummary, BatchError> {
        let operation = self.inner.operations.get(operation_id).await?;
        if !operation.status.is_terminal() {
            return Err(BatchError::StillRunning(operation_id));
        }
        let (token, guard) = self.inner.register(operation_id)?;

        let span = operation_span(operation_id, &operation.org_id, "retry");
        let inner = self.inner.clone();
        let pass = tokio::spawn(
            async move {
                let summary = inner.retry_pass(operation, token).await;
                drop(guard);
                summary
            }
            .instrument(span),
        );
        match pass.await {
            Ok(summary) => summary,
            Err(err) => Err(BatchError::TaskAborted {
                operation_id,
                message: err.to_string(),
            }),
        }
    }

    /// Counts plus one row per record, ordered by index.
    pub async fn results_summary(&self, operation_id: Uuid) -> Result<ResultsSummary, BatchError> {
        let operation = self.inner.operations.get(operation_id).await?;
        let details = self.inner.details.list(operation_id).await?;
        Ok(ResultsSummary::new(&operation, &details))
    }

    /// Non-deleted operations of an organization, newest first.
    pub async fn list_operations(&self, org_id: &str) -> Result<Vec<BulkOperation>, BatchError> {
        Ok(self.inner.operations.list_for_org(org_id).await?)
    }

    /// Soft-deletes an operation that is not running.
    pub async fn delete_operation(&self, operation_id: Uuid) -> Result<(), BatchError> {
        if self.is_running(operation_id) {
            return Err(BatchError::StillRunning(operation_id));
        }
        Ok(self.inner.operations.soft_delete(operation_id).await?)
    }

    /// Snapshot of the per-stage metrics.
    #[must_use]
    pub fn metrics(&self) -> BTreeMap<String, StageMetrics> {
        self.inner.metrics.snapshot()
    }

    /// The shared metrics accumulator.
    #[must_use]
    pub fn metrics_handle(&self) -> &Arc<PipelineMetrics> {
        &self.inner.metrics
    }

    /// Circuit breakers shared by every run of this coordinator.
    #[must_use]
    pub fn breakers(&self) -> &DependencyBreakers {
        &self.inner.breakers
    }

    /// The onboarding pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }
}

impl Inner {
    fn register(
        self: &Arc<Self>,
        operation_id: Uuid,
    ) -> Result<(Arc<CancellationToken>, RunGuard), BatchError> {
        match self.active.entry(operation_id) {
            Entry::Occupied(_) => Err(BatchError::StillRunning(operation_id)),
            Entry::Vacant(slot) => {
                let token = Arc::new(CancellationToken::new());
                let (done_tx, done_rx) = watch::channel(false);
                slot.insert(ActiveRun {
                    token: token.clone(),
                    done: done_rx,
                });
                Ok((
                    token,
                    RunGuard {
                        inner: self.clone(),
                        operation_id,
                        done: done_tx,
                    },
                ))
            }
        }
    }

    async fn retry_pass(
        self: &Arc<Self>,
        operation: BulkOperation,
        token: Arc<CancellationToken>,
    ) -> Result<RetrySummary, BatchError> {
        let operation_id = operation.id;
        let max_retries = self.config.max_retries;
        let claimed: Vec<ProcessingDetail> = self
            .details
            .list_retryable(operation_id, max_retries)
            .await?
            .into_iter()
            .filter(|detail| detail.is_retry_eligible(max_retries))
            .collect();

        if claimed.is_empty() {
            debug!(%operation_id, max_retries, "no records eligible for retry");
            return Ok(RetrySummary {
                operation_id,
                retried: 0,
                recovered: 0,
                still_failed: 0,
                operation,
            });
        }

        let retried = claimed.len();
        info!(%operation_id, retried, "retry pass started");
        let report = self
            .process(&operation, claimed, &token, Pass::Retry)
            .await?;

        let operation = self.operations.get(operation_id).await?;
        let recovered = report.successful + report.skipped;
        info!(
            %operation_id,
            retried,
            dispatched = report.written,
            recovered,
            still_failed = report.failed,
            "retry pass finished"
        );
        self.events.try_emit(BulkEvent::RetryCompleted {
            operation_id,
            retried,
            recovered,
            still_failed: report.failed,
        });
        Ok(RetrySummary {
            operation_id,
            retried,
            recovered,
            still_failed: report.failed,
            operation,
        })
    }

    async fn run_batch(
        self: &Arc<Self>,
        operation: BulkOperation,
        pending: Vec<ProcessingDetail>,
        token: Arc<CancellationToken>,
    ) {
        let operation_id = operation.id;
        let operation = match self.operations.mark_started(operation_id).await {
            Ok(started) => started,
            Err(err) => {
                error!(%operation_id, error = %err, "could not start bulk operation");
                self.fail(operation_id, err.to_string()).await;
                return;
            }
        };
        self.events.try_emit(BulkEvent::Started {
            operation_id,
            org_id: operation.org_id.clone(),
            total: operation.total,
        });

        let fatal = match self.process(&operation, pending, &token, Pass::Initial).await {
            Ok(report) => {
                debug!(%operation_id, written = report.written, "all outcomes written");
                None
            }
            Err(err) => Some(err),
        };
        self.conclude(operation_id, &token, fatal).await;
    }

    /// Runs `items` through the pipeline on at most `workers` tasks while a
    /// single writer persists outcomes in order of completion.
    async fn process(
        self: &Arc<Self>,
        operation: &BulkOperation,
        items: Vec<ProcessingDetail>,
        token: &Arc<CancellationToken>,
        pass: Pass,
    ) -> Result<PassReport, BatchError> {
        let operation_id = operation.id;
        let flush_size = self.config.detail_flush_size.max(1);
        let (tx, rx) = mpsc::channel::<Completion>(flush_size.max(self.config.workers()) * 2);
        let writer = tokio::spawn(
            self.clone()
                .write_outcomes(operation_id, rx, pass, token.clone())
                .in_current_span(),
        );

        let shared = Arc::new(operation.clone());
        let semaphore = Arc::new(Semaphore::new(self.config.workers()));
        let mut workers = FuturesUnordered::new();
        let mut dispatched = 0usize;

        for mut detail in items {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if pass == Pass::Retry {
                detail.retry_count += 1;
                detail.updated_at = Utc::now();
            }
            let inner = self.clone();
            let operation = shared.clone();
            let token = token.clone();
            let tx = tx.clone();
            dispatched += 1;
            workers.push(tokio::spawn(
                async move {
                    let completion = inner.process_one(&operation, detail, token).await;
                    // The writer is gone only after a fatal store error.
                    let _ = tx.send(completion).await;
                    drop(permit);
                }
                .in_current_span(),
            ));
        }
        drop(tx);

        if token.is_cancelled() {
            info!(%operation_id, dispatched, "dispatch stopped by cancellation");
        }
        while let Some(joined) = workers.next().await {
            if let Err(err) = joined {
                error!(%operation_id, error = %err, "record worker aborted");
            }
        }

        match writer.await {
            Ok(result) => result.map_err(BatchError::from),
            Err(err) => Err(BatchError::TaskAborted {
                operation_id,
                message: err.to_string(),
            }),
        }
    }

    async fn process_one(
        &self,
        operation: &BulkOperation,
        mut detail: ProcessingDetail,
        token: Arc<CancellationToken>,
    ) -> Completion {
        let previous = detail.status;
        let mut ctx = ProcessingContext::new(
            operation.id,
            operation.org_id.as_str(),
            operation.user_id.as_str(),
            detail.record_index,
            detail.record.clone(),
        )
        .with_dedup_policy(operation.options.dedup_policy)
        .with_agent_id(operation.options.agent_id.clone())
        .with_resume(detail.resume_state())
        .with_cancellation(token);
        if detail.retry_count > 0 {
            ctx.metadata
                .insert("retry_count".to_string(), detail.retry_count.into());
        }

        let result = self.pipeline.execute(&mut ctx, detail.record.clone()).await;
        let elapsed = ctx.elapsed();
        let results = ctx.into_results();
        let now = Utc::now();
        match result {
            Ok(PipelineOutcome::Completed(_)) => detail.mark_success(results, now),
            Ok(PipelineOutcome::Skipped { stage, reason }) => {
                detail.mark_skipped(stage, reason, results, now);
            }
            Err(err) => detail.mark_failed(&err, results, now),
        }
        debug!(
            record_index = detail.record_index,
            status = %detail.status,
            duration_ms = duration_ms(elapsed),
            "record finished"
        );
        Completion { detail, previous }
    }

    /// Drains completions, persisting details before counting them so an
    /// operation never completes ahead of its details.
    async fn write_outcomes(
        self: Arc<Self>,
        operation_id: Uuid,
        mut rx: mpsc::Receiver<Completion>,
        pass: Pass,
        token: Arc<CancellationToken>,
    ) -> Result<PassReport, StoreError> {
        let flush_size = self.config.detail_flush_size.max(1);
        let mut report = PassReport::default();
        let mut buffer = Vec::with_capacity(flush_size);

        while let Some(first) = rx.recv().await {
            buffer.push(first);
            while buffer.len() < flush_size {
                match rx.try_recv() {
                    Ok(next) => buffer.push(next),
                    Err(_) => break,
                }
            }
            if let Err(err) = self.flush(operation_id, &mut buffer, pass, &mut report).await {
                error!(%operation_id, error = %err, "failed to persist record outcomes");
                token.cancel(STORE_UNAVAILABLE);
                return Err(err);
            }
        }
        Ok(report)
    }

    async fn flush(
        &self,
        operation_id: Uuid,
        buffer: &mut Vec<Completion>,
        pass: Pass,
        report: &mut PassReport,
    ) -> Result<(), StoreError> {
        let batch = std::mem::take(buffer);
        self.details
            .update_batch(batch.iter().map(|c| c.detail.clone()).collect())
            .await?;

        for Completion { detail, previous } in batch {
            match pass {
                Pass::Initial => self.operations.record_outcome(operation_id, detail.status).await?,
                Pass::Retry => {
                    self.operations
                        .record_retry_outcome(operation_id, previous, detail.status)
                        .await?
                }
            };
            report.written += 1;
            match detail.status {
                DetailStatus::Success => report.successful += 1,
                DetailStatus::Failed => report.failed += 1,
                DetailStatus::Skipped => report.skipped += 1,
                DetailStatus::Pending => {}
            }
            self.events.try_emit(BulkEvent::RecordCompleted {
                operation_id,
                record_index: detail.record_index,
                status: detail.status,
                error_code: detail.error_code,
            });
        }
        Ok(())
    }

    /// Settles the lifecycle once workers and writer are done.
    async fn conclude(
        &self,
        operation_id: Uuid,
        token: &CancellationToken,
        fatal: Option<BatchError>,
    ) {
        if let Some(err) = fatal {
            self.fail(operation_id, format!("{STORE_UNAVAILABLE}: {err}")).await;
            return;
        }

        let operation = match self.operations.get(operation_id).await {
            Ok(operation) => operation,
            Err(err) => {
                error!(%operation_id, error = %err, "could not load operation to finish it");
                return;
            }
        };

        if token.is_cancelled() && operation.status == OperationStatus::Processing {
            let reason = token.reason().unwrap_or_default();
            match self
                .operations
                .finish(operation_id, OperationStatus::Cancelled, Some(reason.clone()))
                .await
            {
                Ok(cancelled) => {
                    warn!(
                        %operation_id,
                        processed = cancelled.processed,
                        total = cancelled.total,
                        "bulk operation cancelled"
                    );
                    self.events.try_emit(BulkEvent::Cancelled {
                        operation_id,
                        reason,
                        processed: cancelled.processed,
                    });
                }
                Err(err) => error!(%operation_id, error = %err, "could not cancel operation"),
            }
            return;
        }

        match operation.status {
            OperationStatus::Completed => {
                info!(
                    %operation_id,
                    successful = operation.successful,
                    failed = operation.failed,
                    skipped = operation.skipped,
                    duration_ms = operation.processing_duration_ms.unwrap_or_default(),
                    "bulk operation completed"
                );
                self.events.try_emit(BulkEvent::Completed {
                    operation_id,
                    successful: operation.successful,
                    failed: operation.failed,
                    skipped: operation.skipped,
                    duration_ms: operation.processing_duration_ms.unwrap_or_default(),
                });
            }
            OperationStatus::Processing => {
                let message = format!("{} records did not complete", operation.remaining());
                self.fail(operation_id, message).await;
            }
            OperationStatus::Pending | OperationStatus::Failed | OperationStatus::Cancelled => {}
        }
    }

    async fn fail(&self, operation_id: Uuid, reason: String) {
        match self
            .operations
            .finish(operation_id, OperationStatus::Failed, Some(reason.clone()))
            .await
        {
            Ok(_) => {
                error!(%operation_id, reason = %reason, "bulk operation failed");
                self.events.try_emit(BulkEvent::Failed {
                    operation_id,
                    reason,
                });
            }
            Err(err) => error!(%operation_id, error = %err, "could not mark operation failed"),
        }
    }
}

