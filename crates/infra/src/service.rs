//! Pipeline facade: the one entry point callers (API handlers, schedulers,
//! operator tooling) go through.

use thiserror::Error;
use tracing::info;

use payrun_core::{BatchId, DeadLetterId, QueueItemId, RunId, TenantId, UserId};
use payrun_payroll::{
    DeadLetterItem, MetricBucket, QueueItem, QueueItemStatus, Resolution, RetryPolicy, Run,
};

use crate::coordinator::{InitiateError, RunCoordinator};
use crate::external::artifacts::{ArtifactStore, ArtifactStoreError};
use crate::external::batch::BatchDirectory;
use crate::external::render::RenderEngine;
use crate::queue_store::{
    DeadLetterFilter, ItemFilter, MetricRange, Pagination, QueueStats, QueueStore, QueueStoreError,
    RunFilter,
};
use crate::worker::{CycleOutcome, GenerationWorker, WorkerError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("queue item {0} not found")]
    ItemNotFound(QueueItemId),

    #[error("dead letter {0} not found")]
    DeadLetterNotFound(DeadLetterId),

    #[error("queue item {0} has no stored artifact")]
    ArtifactNotReady(QueueItemId),

    #[error(transparent)]
    Initiate(#[from] InitiateError),

    #[error(transparent)]
    Store(#[from] QueueStoreError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Artifact(#[from] ArtifactStoreError),

    #[error(transparent)]
    Domain(#[from] payrun_core::DomainError),
}

/// Payslip generation pipeline.
///
/// Owns a coordinator and a worker over shared collaborators; background
/// loops (worker threads, sweeper, aggregator) are wired up separately by the
/// host process and share the same store.
pub struct PipelineService<S, B, R, A> {
    store: S,
    coordinator: RunCoordinator<S, B>,
    worker: GenerationWorker<S, R, A>,
    artifacts: A,
}

impl<S, B, R, A> PipelineService<S, B, R, A>
where
    S: QueueStore + Clone,
    B: BatchDirectory,
    R: RenderEngine,
    A: ArtifactStore + Clone,
{
    pub fn new(store: S, directory: B, render: R, artifacts: A) -> Self {
        Self {
            coordinator: RunCoordinator::new(store.clone(), directory),
            worker: GenerationWorker::new(store.clone(), render, artifacts.clone()),
            store,
            artifacts,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.coordinator = self.coordinator.with_max_retries(policy.max_retries);
        self.worker = self.worker.with_retry_policy(policy);
        self
    }

    /// Start a generation run for a batch.
    pub fn initiate_generation(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
        force_regenerate: bool,
    ) -> Result<RunId, PipelineError> {
        Ok(self
            .coordinator
            .initiate(tenant_id, batch_id, force_regenerate)?)
    }

    /// Run one synchronous claim-and-drain worker cycle.
    ///
    /// Deployment hook for environments without long-lived worker threads
    /// (cron triggers, tests, serverless invocations).
    pub fn trigger_worker_cycle(
        &self,
        tenant_id: Option<TenantId>,
        limit: usize,
    ) -> Result<CycleOutcome, PipelineError> {
        Ok(self.worker.run_cycle(tenant_id, limit)?)
    }

    pub fn get_run(&self, tenant_id: TenantId, run_id: RunId) -> Result<Run, PipelineError> {
        self.store
            .get_run(tenant_id, run_id)?
            .ok_or(PipelineError::RunNotFound(run_id))
    }

    pub fn list_runs(
        &self,
        tenant_id: TenantId,
        filter: &RunFilter,
        page: Pagination,
    ) -> Result<Vec<Run>, PipelineError> {
        Ok(self.store.list_runs(tenant_id, filter, page)?)
    }

    pub fn list_queue_items(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        filter: &ItemFilter,
        page: Pagination,
    ) -> Result<Vec<QueueItem>, PipelineError> {
        Ok(self.store.list_items(tenant_id, run_id, filter, page)?)
    }

    pub fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        filter: &DeadLetterFilter,
        page: Pagination,
    ) -> Result<Vec<DeadLetterItem>, PipelineError> {
        Ok(self.store.list_dead_letters(tenant_id, filter, page)?)
    }

    pub fn list_metrics(
        &self,
        tenant_id: TenantId,
        range: MetricRange,
    ) -> Result<Vec<MetricBucket>, PipelineError> {
        Ok(self.store.list_metrics(tenant_id, range)?)
    }

    /// Cancel a run. Pending items are cancelled, in-flight items finish
    /// naturally, already-stored artifacts are kept.
    pub fn cancel_run(&self, tenant_id: TenantId, run_id: RunId) -> Result<Run, PipelineError> {
        let run = self.store.cancel_run(tenant_id, run_id)?;
        info!(%tenant_id, %run_id, cancelled = run.cancelled_count, "run cancelled");
        Ok(run)
    }

    /// Manually requeue a failed item with a fresh retry budget.
    pub fn retry_queue_item(
        &self,
        tenant_id: TenantId,
        item_id: QueueItemId,
    ) -> Result<QueueItem, PipelineError> {
        let item = self.store.retry_item(tenant_id, item_id)?;
        info!(%tenant_id, %item_id, "queue item manually requeued");
        Ok(item)
    }

    /// Record an operator decision on a dead letter.
    ///
    /// Resolution is bookkeeping only; requeueing the underlying item is a
    /// separate, explicit `retry_queue_item` call.
    pub fn resolve_dead_letter(
        &self,
        tenant_id: TenantId,
        dead_letter_id: DeadLetterId,
        resolution: Resolution,
        resolved_by: UserId,
    ) -> Result<DeadLetterItem, PipelineError> {
        let mut dead_letter = self
            .store
            .get_dead_letter(tenant_id, dead_letter_id)?
            .ok_or(PipelineError::DeadLetterNotFound(dead_letter_id))?;
        dead_letter.resolve(resolution, resolved_by)?;
        self.store.update_dead_letter(&dead_letter)?;
        info!(%tenant_id, %dead_letter_id, resolution = ?resolution, "dead letter resolved");
        Ok(dead_letter)
    }

    /// Fetch the stored artifact bytes for a completed item.
    pub fn download_artifact(
        &self,
        tenant_id: TenantId,
        item_id: QueueItemId,
    ) -> Result<Vec<u8>, PipelineError> {
        let item = self
            .store
            .get_item(tenant_id, item_id)?
            .ok_or(PipelineError::ItemNotFound(item_id))?;
        if item.status != QueueItemStatus::Completed {
            return Err(PipelineError::ArtifactNotReady(item_id));
        }
        self.artifacts
            .get(&item.storage_path)?
            .ok_or(PipelineError::ArtifactNotReady(item_id))
    }

    /// Queue depth counters for a tenant.
    pub fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, PipelineError> {
        Ok(self.store.stats(tenant_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::artifacts::InMemoryArtifactStore;
    use crate::external::batch::InMemoryBatchDirectory;
    use crate::external::render::InMemoryRenderEngine;
    use crate::queue_store::InMemoryQueueStore;
    use payrun_payroll::RunStatus;
    use std::sync::Arc;
    use std::time::Duration;

    type TestService = PipelineService<
        Arc<InMemoryQueueStore>,
        Arc<InMemoryBatchDirectory>,
        Arc<InMemoryRenderEngine>,
        Arc<InMemoryArtifactStore>,
    >;

    fn setup() -> (TestService, Arc<InMemoryBatchDirectory>, Arc<InMemoryRenderEngine>, TenantId) {
        let store = InMemoryQueueStore::arc();
        let directory = Arc::new(InMemoryBatchDirectory::new());
        let render = Arc::new(InMemoryRenderEngine::new());
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let service = PipelineService::new(store, directory.clone(), render.clone(), artifacts)
            .with_retry_policy(RetryPolicy::fixed(3, Duration::ZERO));
        (service, directory, render, TenantId::new())
    }

    #[test]
    fn initiate_process_and_download() {
        let (service, directory, _, tenant) = setup();
        let batch = directory.seed_ready_batch(tenant, 3);

        let run_id = service.initiate_generation(tenant, batch, false).unwrap();
        let outcome = service.trigger_worker_cycle(Some(tenant), 10).unwrap();
        assert_eq!(outcome.succeeded, 3);

        let run = service.get_run(tenant, run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        let items = service
            .list_queue_items(tenant, run_id, &ItemFilter::default(), Pagination::default())
            .unwrap();
        let bytes = service.download_artifact(tenant, items[0].id).unwrap();
        assert!(!bytes.is_empty());
    }

    #[test]
    fn download_rejects_incomplete_item() {
        let (service, directory, _, tenant) = setup();
        let batch = directory.seed_ready_batch(tenant, 1);
        let run_id = service.initiate_generation(tenant, batch, false).unwrap();

        let items = service
            .list_queue_items(tenant, run_id, &ItemFilter::default(), Pagination::default())
            .unwrap();
        let err = service.download_artifact(tenant, items[0].id).unwrap_err();
        assert!(matches!(err, PipelineError::ArtifactNotReady(_)));
    }

    #[test]
    fn dead_letter_resolution_and_manual_retry_flow() {
        let (service, directory, render, tenant) = setup();
        let batch = directory.seed_ready_batch(tenant, 1);
        let run_id = service.initiate_generation(tenant, batch, false).unwrap();

        let items = service
            .list_queue_items(tenant, run_id, &ItemFilter::default(), Pagination::default())
            .unwrap();
        render.fail_employee(items[0].employee_id);

        // Drain the retry budget (initial attempt + 3 retries).
        for _ in 0..4 {
            service.trigger_worker_cycle(Some(tenant), 10).unwrap();
        }
        let dls = service
            .list_dead_letters(tenant, &DeadLetterFilter::default(), Pagination::default())
            .unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].total_attempts, 4);
        assert_eq!(service.get_run(tenant, run_id).unwrap().status, RunStatus::Failed);

        // Operator fixes the template, resolves and requeues.
        let operator = UserId::new();
        let resolved = service
            .resolve_dead_letter(tenant, dls[0].id, Resolution::Resolved, operator)
            .unwrap();
        assert_eq!(resolved.resolved_by, Some(operator));

        let item = service
            .retry_queue_item(tenant, dls[0].queue_item_id)
            .unwrap();
        assert_eq!(item.status, QueueItemStatus::Pending);
        assert_eq!(item.retry_count, 0);

        // Template fixed: the reprocess shifts failed to succeeded.
        render.unfail_employee(item.employee_id);
        service.trigger_worker_cycle(Some(tenant), 10).unwrap();
        let run = service.get_run(tenant, run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.failed_count, 0);
        assert_eq!(run.succeeded_count, 1);
    }

    #[test]
    fn cancel_stops_pending_work() {
        let (service, directory, _, tenant) = setup();
        let batch = directory.seed_ready_batch(tenant, 4);
        let run_id = service.initiate_generation(tenant, batch, false).unwrap();

        let run = service.cancel_run(tenant, run_id).unwrap();
        assert_eq!(run.cancelled_count, 4);
        assert_eq!(run.status, RunStatus::Cancelled);

        // Nothing left for a worker to pick up.
        let outcome = service.trigger_worker_cycle(Some(tenant), 10).unwrap();
        assert_eq!(outcome.claimed, 0);
    }
}
