//! In-memory queue store for tests/dev.
//!
//! A single `RwLock` over the whole state makes every multi-row operation
//! (claim, finalization, cancellation) trivially atomic and linearizable.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

use payrun_core::{
    BatchId, DeadLetterId, DomainError, QueueItemId, RunId, TenantId, WorkerId,
};
use payrun_payroll::{
    DeadLetterItem, MetricBucket, QueueItem, QueueItemStatus, Run, RunStatus,
};

use super::query::{DeadLetterFilter, ItemFilter, MetricRange, Pagination, RunFilter};
use super::r#trait::{QueueStats, QueueStore, QueueStoreError, claim_owner};

#[derive(Debug, Default)]
struct Inner {
    runs: HashMap<RunId, Run>,
    items: HashMap<QueueItemId, QueueItem>,
    dead_letters: HashMap<DeadLetterId, DeadLetterItem>,
    metrics: HashMap<(TenantId, DateTime<Utc>), MetricBucket>,
}

impl Inner {
    fn run_mut(&mut self, run_id: RunId) -> Result<&mut Run, QueueStoreError> {
        self.runs.get_mut(&run_id).ok_or(QueueStoreError::NotFound)
    }

    /// Distinct workers currently holding items of this run.
    fn active_worker_count(&self, run_id: RunId) -> u64 {
        let mut workers: Vec<WorkerId> = self
            .items
            .values()
            .filter(|i| i.run_id == run_id && i.status.is_in_flight())
            .filter_map(|i| i.worker_id)
            .collect();
        workers.sort_unstable_by_key(|w| *w.as_uuid());
        workers.dedup();
        workers.len() as u64
    }

    /// Ownership fence for post-claim writes: the stored row must still be
    /// in flight under `owner`'s claim.
    fn check_claim(
        &self,
        tenant_id: TenantId,
        item_id: QueueItemId,
        owner: WorkerId,
    ) -> Result<(), QueueStoreError> {
        let stored = self.items.get(&item_id).ok_or(QueueStoreError::NotFound)?;
        if stored.tenant_id != tenant_id {
            return Err(QueueStoreError::TenantIsolation);
        }
        if !stored.status.is_in_flight() || stored.worker_id != Some(owner) {
            return Err(QueueStoreError::OwnershipLost(item_id));
        }
        Ok(())
    }

    fn dead_letter_exists_for(&self, item_id: QueueItemId) -> bool {
        self.dead_letters
            .values()
            .any(|dl| dl.queue_item_id == item_id)
    }
}

/// In-memory queue store.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    inner: RwLock<Inner>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl QueueStore for InMemoryQueueStore {
    fn create_run(&self, run: Run, items: Vec<QueueItem>) -> Result<RunId, QueueStoreError> {
        let mut inner = self.inner.write().unwrap();

        let active = inner.runs.values().any(|r| {
            r.tenant_id == run.tenant_id && r.batch_id == run.batch_id && !r.status.is_terminal()
        });
        if active {
            return Err(QueueStoreError::ActiveRunExists(run.batch_id));
        }

        for item in &items {
            if item.run_id != run.id || item.tenant_id != run.tenant_id {
                return Err(QueueStoreError::Domain(DomainError::invariant(
                    "queue item does not belong to the run being created",
                )));
            }
        }

        let run_id = run.id;
        inner.runs.insert(run_id, run);
        for item in items {
            inner.items.insert(item.id, item);
        }
        Ok(run_id)
    }

    fn get_run(&self, tenant_id: TenantId, run_id: RunId) -> Result<Option<Run>, QueueStoreError> {
        let inner = self.inner.read().unwrap();
        match inner.runs.get(&run_id) {
            Some(run) if run.tenant_id == tenant_id => Ok(Some(run.clone())),
            Some(_) => Err(QueueStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    fn list_runs(
        &self,
        tenant_id: TenantId,
        filter: &RunFilter,
        page: Pagination,
    ) -> Result<Vec<Run>, QueueStoreError> {
        let inner = self.inner.read().unwrap();
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .filter(|r| filter.batch_id.map_or(true, |b| r.batch_id == b))
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .filter(|r| filter.created_after.map_or(true, |t| r.created_at > t))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(page.slice(runs))
    }

    fn max_file_version(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<u32, QueueStoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .runs
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.batch_id == batch_id)
            .map(|r| r.file_version)
            .max()
            .unwrap_or(0))
    }

    fn active_run_exists(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<bool, QueueStoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner.runs.values().any(|r| {
            r.tenant_id == tenant_id && r.batch_id == batch_id && !r.status.is_terminal()
        }))
    }

    fn claim_batch(
        &self,
        tenant_id: Option<TenantId>,
        worker_id: WorkerId,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        let mut inner = self.inner.write().unwrap();
        let now = Utc::now();

        // FIFO by creation time; the v7 ID is the tiebreaker.
        let mut candidates: Vec<(DateTime<Utc>, QueueItemId)> = inner
            .items
            .values()
            .filter(|i| i.is_claimable(now))
            .filter(|i| tenant_id.map_or(true, |t| i.tenant_id == t))
            .map(|i| (i.created_at, i.id))
            .collect();
        candidates.sort_by_key(|(created_at, id)| (*created_at, *id.as_uuid()));
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            let item = inner.items.get_mut(&id).ok_or(QueueStoreError::NotFound)?;
            item.mark_claimed(worker_id, now)?;
            let run_id = item.run_id;
            let snapshot = item.clone();
            inner.run_mut(run_id)?.note_claimed(now);
            claimed.push(snapshot);
        }
        Ok(claimed)
    }

    fn get_item(
        &self,
        tenant_id: TenantId,
        item_id: QueueItemId,
    ) -> Result<Option<QueueItem>, QueueStoreError> {
        let inner = self.inner.read().unwrap();
        match inner.items.get(&item_id) {
            Some(item) if item.tenant_id == tenant_id => Ok(Some(item.clone())),
            Some(_) => Err(QueueStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    fn list_items(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        filter: &ItemFilter,
        page: Pagination,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        let inner = self.inner.read().unwrap();
        let mut items: Vec<QueueItem> = inner
            .items
            .values()
            .filter(|i| i.tenant_id == tenant_id && i.run_id == run_id)
            .filter(|i| filter.status.map_or(true, |s| i.status == s))
            .filter(|i| filter.employee_id.map_or(true, |e| i.employee_id == e))
            .cloned()
            .collect();
        items.sort_by_key(|i| (i.created_at, *i.id.as_uuid()));
        Ok(page.slice(items))
    }

    fn update_item(&self, item: &QueueItem) -> Result<(), QueueStoreError> {
        if item.status.is_terminal() {
            return Err(QueueStoreError::Domain(DomainError::illegal_transition(
                "terminal item updates must go through finalization",
            )));
        }
        let owner = claim_owner(item)?;
        let mut inner = self.inner.write().unwrap();
        inner.check_claim(item.tenant_id, item.id, owner)?;
        inner.items.insert(item.id, item.clone());
        Ok(())
    }

    fn requeue_item(
        &self,
        item: &QueueItem,
        owner: WorkerId,
    ) -> Result<(), QueueStoreError> {
        if item.status != QueueItemStatus::Pending {
            return Err(QueueStoreError::Domain(DomainError::illegal_transition(
                "requeue_item requires a Pending item",
            )));
        }
        let mut inner = self.inner.write().unwrap();
        inner.check_claim(item.tenant_id, item.id, owner)?;
        inner.items.insert(item.id, item.clone());
        Ok(())
    }

    fn finalize_success(&self, item: &QueueItem) -> Result<Run, QueueStoreError> {
        if item.status != QueueItemStatus::Completed {
            return Err(QueueStoreError::Domain(DomainError::illegal_transition(
                "finalize_success requires a Completed item",
            )));
        }
        let owner = claim_owner(item)?;
        let mut inner = self.inner.write().unwrap();
        inner.check_claim(item.tenant_id, item.id, owner)?;
        let now = Utc::now();

        // Item write + run counter update under one lock: the atomic unit.
        inner.items.insert(item.id, item.clone());
        let workers = inner.active_worker_count(item.run_id);
        let run = inner.run_mut(item.run_id)?;
        if run.settled_count() == run.total_employees {
            // Off-budget reprocess of a manually retried item.
            run.record_reprocessed_success(now)?;
        } else {
            run.record_success(item.processing_time_ms.unwrap_or(0), now)?;
            run.update_estimate(now, workers);
        }
        Ok(run.clone())
    }

    fn finalize_failure(
        &self,
        item: &QueueItem,
        dead_letter: DeadLetterItem,
    ) -> Result<Run, QueueStoreError> {
        if item.status != QueueItemStatus::Failed {
            return Err(QueueStoreError::Domain(DomainError::illegal_transition(
                "finalize_failure requires a Failed item",
            )));
        }
        if dead_letter.queue_item_id != item.id {
            return Err(QueueStoreError::Domain(DomainError::invariant(
                "dead letter does not reference the finalized item",
            )));
        }
        let owner = claim_owner(item)?;
        let mut inner = self.inner.write().unwrap();
        inner.check_claim(item.tenant_id, item.id, owner)?;
        let now = Utc::now();
        let error_type = item
            .error_type
            .unwrap_or(payrun_payroll::ErrorType::Other);

        inner.items.insert(item.id, item.clone());
        // Exactly one dead letter per item: a re-exhausted manual retry keeps
        // the original record (the item carries the full history regardless).
        if !inner.dead_letter_exists_for(item.id) {
            inner.dead_letters.insert(dead_letter.id, dead_letter);
        }
        let run = inner.run_mut(item.run_id)?;
        if run.settled_count() < run.total_employees {
            run.record_failure(error_type, now)?;
        }
        Ok(run.clone())
    }

    fn expired_leases(
        &self,
        now: DateTime<Utc>,
        lease_timeout: Duration,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        let inner = self.inner.read().unwrap();
        let mut expired: Vec<QueueItem> = inner
            .items
            .values()
            .filter(|i| i.lease_expired(now, lease_timeout))
            .cloned()
            .collect();
        expired.sort_by_key(|i| i.claimed_at);
        Ok(expired)
    }

    fn retry_item(
        &self,
        tenant_id: TenantId,
        item_id: QueueItemId,
    ) -> Result<QueueItem, QueueStoreError> {
        let mut inner = self.inner.write().unwrap();
        let item = inner.items.get_mut(&item_id).ok_or(QueueStoreError::NotFound)?;
        if item.tenant_id != tenant_id {
            return Err(QueueStoreError::TenantIsolation);
        }
        item.reset_for_manual_retry()?;
        Ok(item.clone())
    }

    fn cancel_run(&self, tenant_id: TenantId, run_id: RunId) -> Result<Run, QueueStoreError> {
        let mut inner = self.inner.write().unwrap();
        let now = Utc::now();

        match inner.runs.get(&run_id) {
            Some(run) if run.tenant_id != tenant_id => {
                return Err(QueueStoreError::TenantIsolation);
            }
            Some(run) if run.status.is_terminal() => {
                return Err(QueueStoreError::Domain(DomainError::illegal_transition(
                    format!("run {run_id} is already terminal"),
                )));
            }
            Some(_) => {}
            None => return Err(QueueStoreError::NotFound),
        }

        let pending: Vec<QueueItemId> = inner
            .items
            .values()
            .filter(|i| i.run_id == run_id && i.status == QueueItemStatus::Pending)
            .map(|i| i.id)
            .collect();
        for id in &pending {
            if let Some(item) = inner.items.get_mut(id) {
                item.mark_cancelled(now)?;
            }
        }

        let run = inner.run_mut(run_id)?;
        run.record_cancelled(pending.len() as u64, now)?;
        Ok(run.clone())
    }

    fn get_dead_letter(
        &self,
        tenant_id: TenantId,
        dead_letter_id: DeadLetterId,
    ) -> Result<Option<DeadLetterItem>, QueueStoreError> {
        let inner = self.inner.read().unwrap();
        match inner.dead_letters.get(&dead_letter_id) {
            Some(dl) if dl.tenant_id == tenant_id => Ok(Some(dl.clone())),
            Some(_) => Err(QueueStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    fn list_dead_letters(
        &self,
        tenant_id: TenantId,
        filter: &DeadLetterFilter,
        page: Pagination,
    ) -> Result<Vec<DeadLetterItem>, QueueStoreError> {
        let inner = self.inner.read().unwrap();
        let mut dls: Vec<DeadLetterItem> = inner
            .dead_letters
            .values()
            .filter(|dl| dl.tenant_id == tenant_id)
            .filter(|dl| filter.resolution.map_or(true, |r| dl.resolution == r))
            .filter(|dl| filter.run_id.map_or(true, |r| dl.run_id == r))
            .cloned()
            .collect();
        dls.sort_by_key(|dl| dl.created_at);
        Ok(page.slice(dls))
    }

    fn update_dead_letter(&self, dead_letter: &DeadLetterItem) -> Result<(), QueueStoreError> {
        let mut inner = self.inner.write().unwrap();
        let existing = inner
            .dead_letters
            .get(&dead_letter.id)
            .ok_or(QueueStoreError::NotFound)?;
        if existing.tenant_id != dead_letter.tenant_id {
            return Err(QueueStoreError::TenantIsolation);
        }
        inner.dead_letters.insert(dead_letter.id, dead_letter.clone());
        Ok(())
    }

    fn terminal_items_in_hour(
        &self,
        tenant_id: TenantId,
        hour_bucket: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        let end = hour_bucket + Duration::hours(1);
        let inner = self.inner.read().unwrap();
        let mut items: Vec<QueueItem> = inner
            .items
            .values()
            .filter(|i| i.tenant_id == tenant_id)
            .filter(|i| {
                matches!(
                    i.status,
                    QueueItemStatus::Completed | QueueItemStatus::Failed
                )
            })
            .filter(|i| {
                i.completed_at
                    .map_or(false, |t| t >= hour_bucket && t < end)
            })
            .cloned()
            .collect();
        items.sort_by_key(|i| i.completed_at);
        Ok(items)
    }

    fn tenants_with_activity(
        &self,
        hour_bucket: DateTime<Utc>,
    ) -> Result<Vec<TenantId>, QueueStoreError> {
        let end = hour_bucket + Duration::hours(1);
        let inner = self.inner.read().unwrap();
        let mut tenants: Vec<TenantId> = inner
            .items
            .values()
            .filter(|i| {
                matches!(
                    i.status,
                    QueueItemStatus::Completed | QueueItemStatus::Failed
                )
            })
            .filter(|i| {
                i.completed_at
                    .map_or(false, |t| t >= hour_bucket && t < end)
            })
            .map(|i| i.tenant_id)
            .collect();
        tenants.sort_unstable_by_key(|t| *t.as_uuid());
        tenants.dedup();
        Ok(tenants)
    }

    fn upsert_metric_bucket(&self, bucket: MetricBucket) -> Result<(), QueueStoreError> {
        let mut inner = self.inner.write().unwrap();
        inner
            .metrics
            .insert((bucket.tenant_id, bucket.hour_bucket), bucket);
        Ok(())
    }

    fn list_metrics(
        &self,
        tenant_id: TenantId,
        range: MetricRange,
    ) -> Result<Vec<MetricBucket>, QueueStoreError> {
        let inner = self.inner.read().unwrap();
        let mut buckets: Vec<MetricBucket> = inner
            .metrics
            .values()
            .filter(|b| b.tenant_id == tenant_id && range.contains(b.hour_bucket))
            .cloned()
            .collect();
        buckets.sort_by_key(|b| b.hour_bucket);
        Ok(buckets)
    }

    fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, QueueStoreError> {
        let inner = self.inner.read().unwrap();
        let mut stats = QueueStats::default();
        for item in inner.items.values() {
            if item.tenant_id != tenant_id {
                continue;
            }
            match item.status {
                QueueItemStatus::Pending => stats.pending += 1,
                QueueItemStatus::Claimed => stats.claimed += 1,
                QueueItemStatus::Processing => stats.processing += 1,
                QueueItemStatus::Completed => stats.completed += 1,
                QueueItemStatus::Failed => stats.failed += 1,
                QueueItemStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats.dead_letters = inner
            .dead_letters
            .values()
            .filter(|dl| dl.tenant_id == tenant_id)
            .count();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payrun_core::EmployeeId;
    use payrun_payroll::{ArtifactReceipt, ItemError, RetryPolicy};

    fn complete(item: &mut QueueItem) {
        item.mark_completed(
            ArtifactReceipt {
                file_hash: "h".into(),
                file_size_bytes: 1,
            },
            Utc::now(),
        )
        .unwrap();
    }

    fn seed_run(store: &InMemoryQueueStore, tenant: TenantId, employees: usize) -> (Run, Vec<QueueItem>) {
        let batch = BatchId::new();
        let run = Run::new(tenant, batch, employees as u64, 1);
        let items: Vec<QueueItem> = (0..employees)
            .map(|_| QueueItem::new(tenant, run.id, EmployeeId::new(), 1, 3))
            .collect();
        store.create_run(run.clone(), items.clone()).unwrap();
        (run, items)
    }

    #[test]
    fn create_run_rejects_second_active_run_for_batch() {
        let store = InMemoryQueueStore::new();
        let tenant = TenantId::new();
        let (run, _) = seed_run(&store, tenant, 2);

        let dup = Run::new(tenant, run.batch_id, 2, 1);
        let err = store.create_run(dup, vec![]).unwrap_err();
        assert!(matches!(err, QueueStoreError::ActiveRunExists(_)));
    }

    #[test]
    fn claim_is_fifo_and_exclusive() {
        let store = InMemoryQueueStore::new();
        let tenant = TenantId::new();
        seed_run(&store, tenant, 3);

        let w1 = WorkerId::new();
        let w2 = WorkerId::new();
        let first = store.claim_batch(Some(tenant), w1, 2).unwrap();
        let second = store.claim_batch(Some(tenant), w2, 2).unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(first.iter().all(|i| i.worker_id == Some(w1)));
        assert!(second.iter().all(|i| i.worker_id == Some(w2)));
        // Nothing left to claim.
        assert!(store.claim_batch(Some(tenant), w1, 1).unwrap().is_empty());
    }

    #[test]
    fn first_claim_flips_run_to_in_progress() {
        let store = InMemoryQueueStore::new();
        let tenant = TenantId::new();
        let (run, _) = seed_run(&store, tenant, 1);

        assert_eq!(store.get_run(tenant, run.id).unwrap().unwrap().status, RunStatus::Pending);
        store.claim_batch(Some(tenant), WorkerId::new(), 1).unwrap();
        let reloaded = store.get_run(tenant, run.id).unwrap().unwrap();
        assert_eq!(reloaded.status, RunStatus::InProgress);
        assert!(reloaded.started_at.is_some());
    }

    #[test]
    fn finalize_success_updates_item_and_run_together() {
        let store = InMemoryQueueStore::new();
        let tenant = TenantId::new();
        let (run, _) = seed_run(&store, tenant, 1);

        let mut item = store
            .claim_batch(Some(tenant), WorkerId::new(), 1)
            .unwrap()
            .remove(0);
        let now = Utc::now();
        item.mark_processing(now).unwrap();
        item.mark_completed(
            payrun_payroll::ArtifactReceipt {
                file_hash: "h".into(),
                file_size_bytes: 10,
            },
            now,
        )
        .unwrap();

        let updated = store.finalize_success(&item).unwrap();
        assert_eq!(updated.status, RunStatus::Completed);
        assert_eq!(updated.succeeded_count, 1);
        let stored = store.get_item(tenant, item.id).unwrap().unwrap();
        assert_eq!(stored.status, QueueItemStatus::Completed);
        let _ = run;
    }

    #[test]
    fn tenant_isolation_on_reads() {
        let store = InMemoryQueueStore::new();
        let tenant = TenantId::new();
        let intruder = TenantId::new();
        let (run, items) = seed_run(&store, tenant, 1);

        assert!(matches!(
            store.get_run(intruder, run.id),
            Err(QueueStoreError::TenantIsolation)
        ));
        assert!(matches!(
            store.get_item(intruder, items[0].id),
            Err(QueueStoreError::TenantIsolation)
        ));
        assert!(store.claim_batch(Some(intruder), WorkerId::new(), 5).unwrap().is_empty());
    }

    #[test]
    fn cancel_run_cancels_only_pending_items() {
        let store = InMemoryQueueStore::new();
        let tenant = TenantId::new();
        let (run, _) = seed_run(&store, tenant, 3);

        // One item in flight, two still pending.
        store.claim_batch(Some(tenant), WorkerId::new(), 1).unwrap();
        let updated = store.cancel_run(tenant, run.id).unwrap();

        assert_eq!(updated.cancelled_count, 2);
        assert!(!updated.status.is_terminal());

        let stats = store.stats(tenant).unwrap();
        assert_eq!(stats.cancelled, 2);
        assert_eq!(stats.claimed, 1);
    }

    #[test]
    fn stale_finalize_after_lease_reclaim_is_rejected() {
        let store = InMemoryQueueStore::new();
        let tenant = TenantId::new();
        let (run, _) = seed_run(&store, tenant, 2);

        // A slow worker claims an item, then the sweeper reclaims the lease
        // and a second worker completes it.
        let zombie = WorkerId::new();
        let mut stale = store.claim_batch(Some(tenant), zombie, 1).unwrap().remove(0);
        let mut swept = stale.clone();
        swept
            .record_failure(
                ItemError::lease_expired("lease expired"),
                &RetryPolicy::fixed(3, std::time::Duration::ZERO),
                Utc::now(),
            )
            .unwrap();
        store.requeue_item(&swept, zombie).unwrap();

        let fresh_worker = WorkerId::new();
        let mut fresh = store
            .claim_batch(Some(tenant), fresh_worker, 1)
            .unwrap()
            .remove(0);
        complete(&mut fresh);
        store.finalize_success(&fresh).unwrap();

        // The zombie comes back with its stale snapshot. The write must be
        // fenced out, leaving the counters at exactly one success.
        complete(&mut stale);
        let err = store.finalize_success(&stale).unwrap_err();
        assert!(matches!(err, QueueStoreError::OwnershipLost(_)));

        let reloaded = store.get_run(tenant, run.id).unwrap().unwrap();
        assert_eq!(reloaded.succeeded_count, 1);
        assert_eq!(reloaded.processed_count, 1);
        assert!(!reloaded.status.is_terminal());
    }

    #[test]
    fn stale_requeue_cannot_overwrite_a_completed_item() {
        let store = InMemoryQueueStore::new();
        let tenant = TenantId::new();
        seed_run(&store, tenant, 1);

        let worker = WorkerId::new();
        let mut item = store.claim_batch(Some(tenant), worker, 1).unwrap().remove(0);
        let sweeper_snapshot = item.clone();

        complete(&mut item);
        store.finalize_success(&item).unwrap();

        // The sweeper still holds the in-flight snapshot from before the
        // worker finished; its requeue must not flip the item back.
        let mut swept = sweeper_snapshot;
        swept
            .record_failure(
                ItemError::lease_expired("lease expired"),
                &RetryPolicy::fixed(3, std::time::Duration::ZERO),
                Utc::now(),
            )
            .unwrap();
        let err = store.requeue_item(&swept, worker).unwrap_err();
        assert!(matches!(err, QueueStoreError::OwnershipLost(_)));

        let stored = store.get_item(tenant, item.id).unwrap().unwrap();
        assert_eq!(stored.status, QueueItemStatus::Completed);
    }

    #[test]
    fn update_item_rejects_a_writer_that_lost_its_claim() {
        let store = InMemoryQueueStore::new();
        let tenant = TenantId::new();
        seed_run(&store, tenant, 1);

        let first = WorkerId::new();
        let mut stale = store.claim_batch(Some(tenant), first, 1).unwrap().remove(0);
        let mut swept = stale.clone();
        swept
            .record_failure(
                ItemError::lease_expired("lease expired"),
                &RetryPolicy::fixed(3, std::time::Duration::ZERO),
                Utc::now(),
            )
            .unwrap();
        store.requeue_item(&swept, first).unwrap();
        let second = WorkerId::new();
        store.claim_batch(Some(tenant), second, 1).unwrap();

        // First worker's processing transition arrives late.
        stale.mark_processing(Utc::now()).unwrap();
        let err = store.update_item(&stale).unwrap_err();
        assert!(matches!(err, QueueStoreError::OwnershipLost(_)));

        let stored = store.get_item(tenant, stale.id).unwrap().unwrap();
        assert_eq!(stored.worker_id, Some(second));
    }

    #[test]
    fn metric_upsert_is_idempotent() {
        let store = InMemoryQueueStore::new();
        let tenant = TenantId::new();
        let hour = payrun_payroll::hour_floor(Utc::now());

        let bucket = MetricBucket::compute(tenant, hour, &[]);
        store.upsert_metric_bucket(bucket.clone()).unwrap();
        store.upsert_metric_bucket(bucket.clone()).unwrap();

        let range = MetricRange {
            from: hour,
            to: hour + Duration::hours(1),
        };
        let listed = store.list_metrics(tenant, range).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], bucket);
    }
}
