//! Generation worker: claims items, renders payslips, applies the
//! retry/dead-letter policy.
//!
//! Workers are stateless over items: all coordination happens through the
//! queue store's atomic claim, so the same logic runs correctly whether
//! invoked by one process or a thousand.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use payrun_core::{TenantId, WorkerId};
use payrun_payroll::{
    ArtifactReceipt, DeadLetterItem, FailureDisposition, ItemError, QueueItem, RetryPolicy,
};

use crate::external::artifacts::ArtifactStore;
use crate::external::render::{RenderEngine, RenderRequest};
use crate::queue_store::{QueueStore, QueueStoreError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] QueueStoreError),

    #[error(transparent)]
    Domain(#[from] payrun_core::DomainError),
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to poll when no items are claimable
    pub poll_interval: Duration,
    /// Items claimed per cycle
    pub claim_batch_size: usize,
    /// Name for logging
    pub name: String,
    /// Optional tenant filter
    pub tenant_id: Option<TenantId>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            claim_batch_size: 10,
            name: "generation-worker".to_string(),
            tenant_id: None,
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_claim_batch_size(mut self, size: usize) -> Self {
        self.claim_batch_size = size;
        self
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub items_processed: u64,
    pub items_succeeded: u64,
    pub items_requeued: u64,
    pub items_dead_lettered: u64,
    pub renders_short_circuited: u64,
    pub uptime_secs: u64,
}

/// Outcome of one bounded claim-and-drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub claimed: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Items whose lease was reclaimed mid-flight; nothing was recorded.
    pub superseded: usize,
}

/// Outcome of processing one claimed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed { short_circuited: bool },
    Requeued,
    DeadLettered,
    /// The store fenced out the write: another worker holds the item now.
    Superseded,
}

/// Centralized failure path, shared verbatim by workers and the lease
/// sweeper so the retry/dead-letter invariants live in exactly one place.
///
/// Requeues the item with backoff while budget remains; otherwise finalizes
/// it as `Failed` together with its dead letter and the parent run's counter
/// update in one atomic store operation. Both writes are fenced on the
/// claim still being held: a stale snapshot (the item was swept and
/// re-claimed, or already finished) yields `None` and writes nothing.
pub fn apply_item_failure<S: QueueStore>(
    store: &S,
    mut item: QueueItem,
    error: ItemError,
    policy: &RetryPolicy,
) -> Result<Option<FailureDisposition>, WorkerError> {
    let Some(owner) = item.worker_id else {
        return Err(WorkerError::Domain(payrun_core::DomainError::invariant(
            "failure path requires a claimed item",
        )));
    };
    let now = Utc::now();
    let disposition = item.record_failure(error, policy, now)?;
    let write = match disposition {
        FailureDisposition::Requeued => store.requeue_item(&item, owner),
        FailureDisposition::Exhausted => {
            let dead_letter = DeadLetterItem::from_exhausted_item(&item)?;
            store.finalize_failure(&item, dead_letter).map(|_| ())
        }
    };
    match write {
        Ok(()) => {
            match disposition {
                FailureDisposition::Requeued => debug!(
                    item_id = %item.id,
                    retry_count = item.retry_count,
                    "attempt failed, item requeued"
                ),
                FailureDisposition::Exhausted => warn!(
                    item_id = %item.id,
                    employee_id = %item.employee_id,
                    total_attempts = item.total_attempts(),
                    "retries exhausted, item dead-lettered"
                ),
            }
            Ok(Some(disposition))
        }
        Err(QueueStoreError::OwnershipLost(_)) => {
            debug!(
                item_id = %item.id,
                worker_id = %owner,
                "claim lost before write-back, dropping stale failure"
            );
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Pulls claimable items and turns them into stored artifacts.
pub struct GenerationWorker<S, R, A> {
    store: S,
    render: R,
    artifacts: A,
    worker_id: WorkerId,
    retry_policy: RetryPolicy,
}

impl<S, R, A> GenerationWorker<S, R, A>
where
    S: QueueStore,
    R: RenderEngine,
    A: ArtifactStore,
{
    pub fn new(store: S, render: R, artifacts: A) -> Self {
        Self {
            store,
            render,
            artifacts,
            worker_id: WorkerId::new(),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Claim and drain one bounded batch of pending items.
    ///
    /// Safe to call with no pending work (no-op returning zeroes).
    pub fn run_cycle(
        &self,
        tenant_id: Option<TenantId>,
        limit: usize,
    ) -> Result<CycleOutcome, WorkerError> {
        let claimed = self.store.claim_batch(tenant_id, self.worker_id, limit)?;
        let mut outcome = CycleOutcome {
            claimed: claimed.len(),
            ..Default::default()
        };

        for item in claimed {
            match self.process_item(item)? {
                ItemOutcome::Completed { .. } => outcome.succeeded += 1,
                ItemOutcome::Requeued => outcome.requeued += 1,
                ItemOutcome::DeadLettered => outcome.dead_lettered += 1,
                ItemOutcome::Superseded => outcome.superseded += 1,
            }
        }
        Ok(outcome)
    }

    /// Process one claimed item through to a terminal or requeued state.
    pub fn process_item(&self, mut item: QueueItem) -> Result<ItemOutcome, WorkerError> {
        // Claimed → Processing before any slow work, so the sweeper can tell
        // "never started" from "started but stuck".
        item.mark_processing(Utc::now())?;
        if let Err(e) = self.store.update_item(&item) {
            return match e {
                QueueStoreError::OwnershipLost(_) => {
                    debug!(item_id = %item.id, "claim lost before processing, skipping item");
                    Ok(ItemOutcome::Superseded)
                }
                other => Err(other.into()),
            };
        }

        // Idempotent render: an artifact already at this item's path means a
        // previous attempt got through rendering before crashing. Treat it as
        // the completed result instead of rendering twice.
        match self.artifacts.head(&item.storage_path) {
            Ok(Some(existing)) => {
                debug!(
                    item_id = %item.id,
                    path = %item.storage_path,
                    "artifact already present, skipping render"
                );
                return self
                    .finish_success(item, existing.content_hash, existing.size_bytes, true);
            }
            Ok(None) => {}
            Err(err) => {
                let disposition = apply_item_failure(
                    &self.store,
                    item,
                    ItemError::storage(err.to_string()),
                    &self.retry_policy,
                )?;
                return Ok(ItemOutcome::from_failure(disposition));
            }
        }

        let request = RenderRequest {
            tenant_id: item.tenant_id,
            run_id: item.run_id,
            employee_id: item.employee_id,
            file_version: item.file_version,
        };
        let document = match self.render.render(&request) {
            Ok(doc) => doc,
            Err(err) => {
                let item_error =
                    ItemError::new(err.error_type(), err.to_string());
                let disposition =
                    apply_item_failure(&self.store, item, item_error, &self.retry_policy)?;
                return Ok(ItemOutcome::from_failure(disposition));
            }
        };

        match self.artifacts.put(&item.storage_path, &document) {
            Ok(meta) => self.finish_success(item, meta.content_hash, meta.size_bytes, false),
            Err(err) => {
                let disposition = apply_item_failure(
                    &self.store,
                    item,
                    ItemError::storage(err.to_string()),
                    &self.retry_policy,
                )?;
                Ok(ItemOutcome::from_failure(disposition))
            }
        }
    }

    fn finish_success(
        &self,
        mut item: QueueItem,
        file_hash: String,
        file_size_bytes: u64,
        short_circuited: bool,
    ) -> Result<ItemOutcome, WorkerError> {
        item.mark_completed(
            ArtifactReceipt {
                file_hash,
                file_size_bytes,
            },
            Utc::now(),
        )?;
        let run = match self.store.finalize_success(&item) {
            Ok(run) => run,
            Err(QueueStoreError::OwnershipLost(_)) => {
                // The lease was swept while we rendered; whoever holds the
                // item now will find the artifact and short-circuit.
                debug!(item_id = %item.id, "claim lost before finalize, dropping stale success");
                return Ok(ItemOutcome::Superseded);
            }
            Err(e) => return Err(e.into()),
        };
        debug!(
            item_id = %item.id,
            run_id = %item.run_id,
            run_status = ?run.status,
            short_circuited,
            "item completed"
        );
        Ok(ItemOutcome::Completed { short_circuited })
    }

    /// Spawn the worker loop in a background thread.
    pub fn spawn(self, config: WorkerConfig) -> WorkerHandle
    where
        S: 'static,
        R: 'static,
        A: 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();

        let name = config.name.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || {
                worker_loop(self, config, shutdown_rx, stats_clone);
            })
            .expect("failed to spawn generation worker thread");

        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

impl ItemOutcome {
    fn from_failure(disposition: Option<FailureDisposition>) -> Self {
        match disposition {
            Some(FailureDisposition::Requeued) => Self::Requeued,
            Some(FailureDisposition::Exhausted) => Self::DeadLettered,
            None => Self::Superseded,
        }
    }
}

fn worker_loop<S, R, A>(
    worker: GenerationWorker<S, R, A>,
    config: WorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<WorkerStats>>,
) where
    S: QueueStore,
    R: RenderEngine,
    A: ArtifactStore,
{
    info!(worker = %config.name, worker_id = %worker.worker_id, "generation worker started");
    let start_time = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        {
            let mut s = stats.lock().unwrap();
            s.uptime_secs = start_time.elapsed().as_secs();
        }

        match worker.run_cycle(config.tenant_id, config.claim_batch_size) {
            Ok(outcome) if outcome.claimed == 0 => {
                thread::sleep(config.poll_interval);
            }
            Ok(outcome) => {
                let mut s = stats.lock().unwrap();
                s.items_processed += outcome.claimed as u64;
                s.items_succeeded += outcome.succeeded as u64;
                s.items_requeued += outcome.requeued as u64;
                s.items_dead_lettered += outcome.dead_lettered as u64;
            }
            Err(e) => {
                error!(worker = %config.name, error = ?e, "worker cycle failed");
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(worker = %config.name, "generation worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::artifacts::InMemoryArtifactStore;
    use crate::external::render::InMemoryRenderEngine;
    use crate::queue_store::{InMemoryQueueStore, ItemFilter, Pagination};
    use payrun_core::{BatchId, EmployeeId};
    use payrun_payroll::{QueueItemStatus, Run, RunStatus};
    use std::sync::Arc;

    type TestWorker = GenerationWorker<
        Arc<InMemoryQueueStore>,
        Arc<InMemoryRenderEngine>,
        Arc<InMemoryArtifactStore>,
    >;

    fn setup(
        employees: usize,
        max_retries: u32,
    ) -> (
        TestWorker,
        Arc<InMemoryQueueStore>,
        Arc<InMemoryRenderEngine>,
        Arc<InMemoryArtifactStore>,
        TenantId,
        payrun_core::RunId,
        Vec<EmployeeId>,
    ) {
        let store = InMemoryQueueStore::arc();
        let render = Arc::new(InMemoryRenderEngine::new());
        let artifacts = Arc::new(InMemoryArtifactStore::new());

        let tenant = TenantId::new();
        let employee_ids: Vec<EmployeeId> = (0..employees).map(|_| EmployeeId::new()).collect();
        let run = Run::new(tenant, BatchId::new(), employees as u64, 1);
        let run_id = run.id;
        let items = employee_ids
            .iter()
            .map(|&e| QueueItem::new(tenant, run_id, e, 1, max_retries))
            .collect();
        store.create_run(run, items).unwrap();

        let worker = GenerationWorker::new(store.clone(), render.clone(), artifacts.clone())
            .with_retry_policy(RetryPolicy::fixed(max_retries, Duration::ZERO));
        (worker, store, render, artifacts, tenant, run_id, employee_ids)
    }

    #[test]
    fn cycle_completes_all_items() {
        let (worker, store, _, artifacts, tenant, run_id, _) = setup(3, 3);

        let outcome = worker.run_cycle(Some(tenant), 10).unwrap();
        assert_eq!(outcome.claimed, 3);
        assert_eq!(outcome.succeeded, 3);

        let run = store.get_run(tenant, run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(artifacts.len(), 3);

        let items = store
            .list_items(tenant, run_id, &ItemFilter::default(), Pagination::default())
            .unwrap();
        assert!(items.iter().all(|i| i.status == QueueItemStatus::Completed));
        assert!(items.iter().all(|i| i.file_hash.is_some()));
        assert!(items.iter().all(|i| i.processing_time_ms.is_some()));
    }

    #[test]
    fn empty_queue_cycle_is_a_noop() {
        let (worker, _, _, _, tenant, _, _) = setup(0, 3);
        // The run itself is rejected as empty upstream; claim on an empty
        // queue must still be harmless.
        let outcome = worker.run_cycle(Some(tenant), 10).unwrap();
        assert_eq!(outcome, CycleOutcome::default());
    }

    #[test]
    fn failing_render_requeues_then_dead_letters() {
        let (worker, store, render, _, tenant, run_id, employees) = setup(1, 2);
        render.fail_employee(employees[0]);

        // Initial attempt + 2 retries, all requeued except the last.
        for _ in 0..2 {
            let outcome = worker.run_cycle(Some(tenant), 10).unwrap();
            assert_eq!(outcome.requeued, 1);
        }
        let outcome = worker.run_cycle(Some(tenant), 10).unwrap();
        assert_eq!(outcome.dead_lettered, 1);

        let run = store.get_run(tenant, run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failed_count, 1);
        assert_eq!(run.error_summary.get("render"), Some(&1));

        let dls = store
            .list_dead_letters(tenant, &Default::default(), Pagination::default())
            .unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].total_attempts, 3);
    }

    #[test]
    fn storage_failure_is_retried() {
        let (worker, store, _, artifacts, tenant, run_id, _) = setup(1, 3);
        artifacts.set_fail_writes(true);

        let outcome = worker.run_cycle(Some(tenant), 10).unwrap();
        assert_eq!(outcome.requeued, 1);

        artifacts.set_fail_writes(false);
        let outcome = worker.run_cycle(Some(tenant), 10).unwrap();
        assert_eq!(outcome.succeeded, 1);

        let run = store.get_run(tenant, run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[test]
    fn existing_artifact_short_circuits_render() {
        let (worker, store, render, artifacts, tenant, run_id, _) = setup(1, 3);

        // Pre-store the artifact at the item's deterministic path, as if a
        // previous attempt crashed after rendering.
        let items = store
            .list_items(tenant, run_id, &ItemFilter::default(), Pagination::default())
            .unwrap();
        let doc = crate::external::render::RenderedDocument::from_bytes(b"previous".to_vec());
        artifacts.put(&items[0].storage_path, &doc).unwrap();

        let outcome = worker.run_cycle(Some(tenant), 10).unwrap();
        assert_eq!(outcome.succeeded, 1);
        // The render engine was never invoked.
        assert_eq!(render.render_count(), 0);

        let item = store.get_item(tenant, items[0].id).unwrap().unwrap();
        assert_eq!(item.status, QueueItemStatus::Completed);
        assert_eq!(item.file_hash.as_deref(), Some(doc.content_hash.as_str()));
    }

    #[test]
    fn stale_failure_write_back_is_dropped() {
        let (worker, store, _, _, tenant, run_id, _) = setup(1, 3);
        let policy = RetryPolicy::fixed(3, Duration::ZERO);

        // A slow worker claims the item, then the sweeper reclaims the lease.
        let zombie = WorkerId::new();
        let stale = store.claim_batch(Some(tenant), zombie, 1).unwrap().remove(0);
        let swept = apply_item_failure(
            &store,
            stale.clone(),
            ItemError::lease_expired("lease expired"),
            &policy,
        )
        .unwrap();
        assert_eq!(swept, Some(FailureDisposition::Requeued));

        // A healthy worker finishes the item.
        let outcome = worker.run_cycle(Some(tenant), 10).unwrap();
        assert_eq!(outcome.succeeded, 1);

        // The slow worker reports its failure from the stale snapshot; the
        // store fences it out and the run stays untouched.
        let late =
            apply_item_failure(&store, stale, ItemError::render("late failure"), &policy)
                .unwrap();
        assert!(late.is_none());

        let run = store.get_run(tenant, run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.succeeded_count, 1);
        assert_eq!(run.failed_count, 0);
    }

    #[test]
    fn spawned_worker_drains_queue_and_shuts_down() {
        let (worker, store, _, _, tenant, run_id, _) = setup(5, 3);

        let handle = worker.spawn(
            WorkerConfig::default()
                .with_name("test-worker")
                .with_tenant(tenant),
        );

        // Wait for the run to complete.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let run = store.get_run(tenant, run_id).unwrap().unwrap();
            if run.status == RunStatus::Completed {
                break;
            }
            assert!(Instant::now() < deadline, "run did not complete in time");
            thread::sleep(Duration::from_millis(10));
        }

        let stats = handle.stats();
        assert_eq!(stats.items_succeeded, 5);
        handle.shutdown();
    }
}
