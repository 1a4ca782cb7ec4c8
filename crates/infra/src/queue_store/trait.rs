//! Queue store trait and error model.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use payrun_core::{
    BatchId, DeadLetterId, DomainError, QueueItemId, RunId, TenantId, WorkerId,
};
use payrun_payroll::{DeadLetterItem, MetricBucket, QueueItem, Run};

use super::query::{DeadLetterFilter, ItemFilter, MetricRange, Pagination, RunFilter};

/// Queue store operation error.
///
/// These are **infrastructure errors** (storage, isolation, conflicting
/// writes) plus domain transition failures surfaced through the store's
/// atomic operations.
#[derive(Debug, Error)]
pub enum QueueStoreError {
    #[error("not found")]
    NotFound,

    #[error("tenant isolation violation")]
    TenantIsolation,

    #[error("an active run already exists for batch {0}")]
    ActiveRunExists(BatchId),

    /// A post-claim write arrived after the stored item changed hands: the
    /// lease was swept and the item re-claimed, or it already reached a
    /// terminal state. The stale writer must drop its update.
    #[error("item {0} is no longer held by the writing worker")]
    OwnershipLost(QueueItemId),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("storage error: {0}")]
    Storage(String),
}

/// The worker a post-claim write is fenced on. An item on a write-back path
/// without a `worker_id` never went through `claim_batch`.
pub(crate) fn claim_owner(item: &QueueItem) -> Result<WorkerId, QueueStoreError> {
    item.worker_id.ok_or_else(|| {
        QueueStoreError::Domain(DomainError::invariant(
            "post-claim write without a worker id",
        ))
    })
}

/// Queue depth counters, tenant-scoped.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub claimed: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub dead_letters: usize,
}

/// Durable table of runs, work items, dead letters and metric buckets.
///
/// ## Implementation requirements
///
/// - **Linearizable claim**: no two concurrent `claim_batch` calls may return
///   the same item. This is the core correctness property of the pipeline.
/// - **Atomic finalization**: `finalize_success`/`finalize_failure` persist
///   the terminal item, the parent run's counter update (and, on failure, the
///   dead letter) as one unit. No item reaches a terminal state without its
///   run being updated, and vice versa.
/// - **Fenced write-backs**: every post-claim write (`update_item`,
///   `requeue_item`, `finalize_success`, `finalize_failure`) succeeds only
///   while the stored row is still in flight under the writing worker's
///   claim. A writer that lost its lease gets `OwnershipLost` and must not
///   be allowed to touch the item or its run counters.
/// - **Tenant isolation**: enforced on every read and write.
/// - **FIFO**: claims hand out pending items oldest-first by `created_at`.
pub trait QueueStore: Send + Sync {
    /// Atomically create a run plus all of its pending items.
    ///
    /// Fails with `ActiveRunExists` when a non-terminal run already exists
    /// for the batch; the check and the insert are one atomic step.
    fn create_run(&self, run: Run, items: Vec<QueueItem>) -> Result<RunId, QueueStoreError>;

    fn get_run(&self, tenant_id: TenantId, run_id: RunId) -> Result<Option<Run>, QueueStoreError>;

    fn list_runs(
        &self,
        tenant_id: TenantId,
        filter: &RunFilter,
        page: Pagination,
    ) -> Result<Vec<Run>, QueueStoreError>;

    /// Highest `file_version` across all runs for a batch (0 when none exist).
    fn max_file_version(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<u32, QueueStoreError>;

    /// Whether a non-terminal run exists for the batch.
    fn active_run_exists(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<bool, QueueStoreError>;

    /// Atomically claim up to `limit` claimable pending items.
    ///
    /// Claimed items move to `Claimed` with `worker_id`/`claimed_at` set, and
    /// each affected run is flipped to `InProgress` on its first claim.
    /// A losing claimant simply sees fewer (or zero) items.
    fn claim_batch(
        &self,
        tenant_id: Option<TenantId>,
        worker_id: WorkerId,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueStoreError>;

    fn get_item(
        &self,
        tenant_id: TenantId,
        item_id: QueueItemId,
    ) -> Result<Option<QueueItem>, QueueStoreError>;

    fn list_items(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        filter: &ItemFilter,
        page: Pagination,
    ) -> Result<Vec<QueueItem>, QueueStoreError>;

    /// Persist an in-flight item update (the processing transition, lease
    /// backdates in tests). Rejects terminal states; those go through
    /// finalization. Fenced: the stored row must still be held by the
    /// item's `worker_id`.
    fn update_item(&self, item: &QueueItem) -> Result<(), QueueStoreError>;

    /// Requeue an item after a failed attempt: back to `Pending` with its
    /// backoff delay. Fenced on `owner` still holding the stored claim, so
    /// a sweeper snapshot cannot overwrite an item that finished or changed
    /// hands in the meantime.
    fn requeue_item(&self, item: &QueueItem, owner: WorkerId)
    -> Result<(), QueueStoreError>;

    /// Persist a `Completed` item and the parent run's counter update as one
    /// atomic unit. Fenced on the item's `worker_id`. Returns the updated run.
    fn finalize_success(&self, item: &QueueItem) -> Result<Run, QueueStoreError>;

    /// Persist a `Failed` item, insert its dead letter, and update the parent
    /// run as one atomic unit. Fenced on the item's `worker_id`. Returns the
    /// updated run.
    fn finalize_failure(
        &self,
        item: &QueueItem,
        dead_letter: DeadLetterItem,
    ) -> Result<Run, QueueStoreError>;

    /// In-flight items whose lease has expired as of `now`.
    fn expired_leases(
        &self,
        now: DateTime<Utc>,
        lease_timeout: Duration,
    ) -> Result<Vec<QueueItem>, QueueStoreError>;

    /// Manual requeue of a `Failed` item: resets the retry budget and clears
    /// error fields, preserving history. Returns the updated item.
    fn retry_item(
        &self,
        tenant_id: TenantId,
        item_id: QueueItemId,
    ) -> Result<QueueItem, QueueStoreError>;

    /// Cancel a run: still-pending items become `Cancelled`, in-flight items
    /// are left to finish naturally. Returns the updated run.
    fn cancel_run(&self, tenant_id: TenantId, run_id: RunId) -> Result<Run, QueueStoreError>;

    fn get_dead_letter(
        &self,
        tenant_id: TenantId,
        dead_letter_id: DeadLetterId,
    ) -> Result<Option<DeadLetterItem>, QueueStoreError>;

    fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        filter: &DeadLetterFilter,
        page: Pagination,
    ) -> Result<Vec<DeadLetterItem>, QueueStoreError>;

    /// Persist an operator resolution on a dead letter.
    fn update_dead_letter(&self, dead_letter: &DeadLetterItem) -> Result<(), QueueStoreError>;

    /// Terminal items (`Completed`/`Failed`) whose `completed_at` falls in
    /// the hour starting at `hour_bucket`.
    fn terminal_items_in_hour(
        &self,
        tenant_id: TenantId,
        hour_bucket: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, QueueStoreError>;

    /// Tenants with at least one terminal item in the given hour.
    fn tenants_with_activity(
        &self,
        hour_bucket: DateTime<Utc>,
    ) -> Result<Vec<TenantId>, QueueStoreError>;

    /// Upsert the bucket row keyed by `(tenant, hour_bucket)`; repeated
    /// aggregation for the same hour must be idempotent.
    fn upsert_metric_bucket(&self, bucket: MetricBucket) -> Result<(), QueueStoreError>;

    fn list_metrics(
        &self,
        tenant_id: TenantId,
        range: MetricRange,
    ) -> Result<Vec<MetricBucket>, QueueStoreError>;

    /// Queue depth counters for a tenant.
    fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, QueueStoreError>;
}

impl<S> QueueStore for std::sync::Arc<S>
where
    S: QueueStore + ?Sized,
{
    fn create_run(&self, run: Run, items: Vec<QueueItem>) -> Result<RunId, QueueStoreError> {
        (**self).create_run(run, items)
    }

    fn get_run(&self, tenant_id: TenantId, run_id: RunId) -> Result<Option<Run>, QueueStoreError> {
        (**self).get_run(tenant_id, run_id)
    }

    fn list_runs(
        &self,
        tenant_id: TenantId,
        filter: &RunFilter,
        page: Pagination,
    ) -> Result<Vec<Run>, QueueStoreError> {
        (**self).list_runs(tenant_id, filter, page)
    }

    fn max_file_version(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<u32, QueueStoreError> {
        (**self).max_file_version(tenant_id, batch_id)
    }

    fn active_run_exists(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<bool, QueueStoreError> {
        (**self).active_run_exists(tenant_id, batch_id)
    }

    fn claim_batch(
        &self,
        tenant_id: Option<TenantId>,
        worker_id: WorkerId,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        (**self).claim_batch(tenant_id, worker_id, limit)
    }

    fn get_item(
        &self,
        tenant_id: TenantId,
        item_id: QueueItemId,
    ) -> Result<Option<QueueItem>, QueueStoreError> {
        (**self).get_item(tenant_id, item_id)
    }

    fn list_items(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        filter: &ItemFilter,
        page: Pagination,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        (**self).list_items(tenant_id, run_id, filter, page)
    }

    fn update_item(&self, item: &QueueItem) -> Result<(), QueueStoreError> {
        (**self).update_item(item)
    }

    fn requeue_item(
        &self,
        item: &QueueItem,
        owner: WorkerId,
    ) -> Result<(), QueueStoreError> {
        (**self).requeue_item(item, owner)
    }

    fn finalize_success(&self, item: &QueueItem) -> Result<Run, QueueStoreError> {
        (**self).finalize_success(item)
    }

    fn finalize_failure(
        &self,
        item: &QueueItem,
        dead_letter: DeadLetterItem,
    ) -> Result<Run, QueueStoreError> {
        (**self).finalize_failure(item, dead_letter)
    }

    fn expired_leases(
        &self,
        now: DateTime<Utc>,
        lease_timeout: Duration,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        (**self).expired_leases(now, lease_timeout)
    }

    fn retry_item(
        &self,
        tenant_id: TenantId,
        item_id: QueueItemId,
    ) -> Result<QueueItem, QueueStoreError> {
        (**self).retry_item(tenant_id, item_id)
    }

    fn cancel_run(&self, tenant_id: TenantId, run_id: RunId) -> Result<Run, QueueStoreError> {
        (**self).cancel_run(tenant_id, run_id)
    }

    fn get_dead_letter(
        &self,
        tenant_id: TenantId,
        dead_letter_id: DeadLetterId,
    ) -> Result<Option<DeadLetterItem>, QueueStoreError> {
        (**self).get_dead_letter(tenant_id, dead_letter_id)
    }

    fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        filter: &DeadLetterFilter,
        page: Pagination,
    ) -> Result<Vec<DeadLetterItem>, QueueStoreError> {
        (**self).list_dead_letters(tenant_id, filter, page)
    }

    fn update_dead_letter(&self, dead_letter: &DeadLetterItem) -> Result<(), QueueStoreError> {
        (**self).update_dead_letter(dead_letter)
    }

    fn terminal_items_in_hour(
        &self,
        tenant_id: TenantId,
        hour_bucket: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        (**self).terminal_items_in_hour(tenant_id, hour_bucket)
    }

    fn tenants_with_activity(
        &self,
        hour_bucket: DateTime<Utc>,
    ) -> Result<Vec<TenantId>, QueueStoreError> {
        (**self).tenants_with_activity(hour_bucket)
    }

    fn upsert_metric_bucket(&self, bucket: MetricBucket) -> Result<(), QueueStoreError> {
        (**self).upsert_metric_bucket(bucket)
    }

    fn list_metrics(
        &self,
        tenant_id: TenantId,
        range: MetricRange,
    ) -> Result<Vec<MetricBucket>, QueueStoreError> {
        (**self).list_metrics(tenant_id, range)
    }

    fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, QueueStoreError> {
        (**self).stats(tenant_id)
    }
}
