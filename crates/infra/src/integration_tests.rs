//! Integration tests for the full generation pipeline.
//!
//! Tests: Coordinator → Queue Store → Worker → Artifact Store, plus the
//! lease sweeper and metrics aggregator riding on the same store.

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use chrono::Utc;

    use payrun_core::{QueueItemId, TenantId, WorkerId};
    use payrun_payroll::{
        ArtifactReceipt, QueueItemStatus, RetryPolicy, RunStatus, hour_floor,
    };

    use crate::aggregator::MetricsAggregator;
    use crate::external::artifacts::InMemoryArtifactStore;
    use crate::external::batch::InMemoryBatchDirectory;
    use crate::external::render::InMemoryRenderEngine;
    use crate::queue_store::{
        DeadLetterFilter, InMemoryQueueStore, ItemFilter, MetricRange, Pagination, QueueStore,
        QueueStoreError,
    };
    use crate::service::PipelineService;
    use crate::sweeper::{LeaseSweeper, SweeperConfig};
    use crate::worker::GenerationWorker;

    type TestService = PipelineService<
        Arc<InMemoryQueueStore>,
        Arc<InMemoryBatchDirectory>,
        Arc<InMemoryRenderEngine>,
        Arc<InMemoryArtifactStore>,
    >;

    struct Harness {
        service: TestService,
        store: Arc<InMemoryQueueStore>,
        directory: Arc<InMemoryBatchDirectory>,
        render: Arc<InMemoryRenderEngine>,
        artifacts: Arc<InMemoryArtifactStore>,
        tenant: TenantId,
    }

    fn setup() -> Harness {
        payrun_observability::init();
        let store = InMemoryQueueStore::arc();
        let directory = Arc::new(InMemoryBatchDirectory::new());
        let render = Arc::new(InMemoryRenderEngine::new());
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let service = PipelineService::new(
            store.clone(),
            directory.clone(),
            render.clone(),
            artifacts.clone(),
        )
        .with_retry_policy(RetryPolicy::fixed(3, Duration::ZERO));
        Harness {
            service,
            store,
            directory,
            render,
            artifacts,
            tenant: TenantId::new(),
        }
    }

    fn drain(h: &Harness) {
        // Enough cycles to exhaust every retry budget.
        for _ in 0..8 {
            h.service.trigger_worker_cycle(Some(h.tenant), 100).unwrap();
        }
    }

    #[test]
    fn happy_path_run_completes_for_every_employee() {
        let h = setup();
        let batch = h.directory.seed_ready_batch(h.tenant, 10);
        let run_id = h.service.initiate_generation(h.tenant, batch, false).unwrap();

        drain(&h);

        let run = h.service.get_run(h.tenant, run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.processed_count, 10);
        assert_eq!(run.succeeded_count, 10);
        assert_eq!(run.failed_count, 0);
        assert!(run.completed_at.is_some());

        let items = h
            .service
            .list_queue_items(h.tenant, run_id, &ItemFilter::default(), Pagination::new(Some(100), None))
            .unwrap();
        assert_eq!(items.len(), 10);
        assert!(items.iter().all(|i| i.status == QueueItemStatus::Completed));
        assert!(items.iter().all(|i| i.file_hash.is_some()));

        assert_eq!(h.artifacts.len(), 10);
        assert!(h
            .service
            .list_dead_letters(h.tenant, &DeadLetterFilter::default(), Pagination::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn persistent_failure_dead_letters_one_item_and_run_is_partial() {
        let h = setup();
        let batch = h.directory.seed_ready_batch(h.tenant, 10);
        let run_id = h.service.initiate_generation(h.tenant, batch, false).unwrap();

        let items = h
            .service
            .list_queue_items(h.tenant, run_id, &ItemFilter::default(), Pagination::new(Some(100), None))
            .unwrap();
        let victim = items[3].employee_id;
        h.render.fail_employee(victim);

        drain(&h);

        let run = h.service.get_run(h.tenant, run_id).unwrap();
        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(run.succeeded_count, 9);
        assert_eq!(run.failed_count, 1);
        assert_eq!(run.error_summary.get("render"), Some(&1));

        let dls = h
            .service
            .list_dead_letters(h.tenant, &DeadLetterFilter::default(), Pagination::default())
            .unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].employee_id, victim);
        // Initial attempt plus three retries.
        assert_eq!(dls[0].total_attempts, 4);
        assert_eq!(dls[0].error_history.len(), 4);

        let failed = h.store.get_item(h.tenant, dls[0].queue_item_id).unwrap().unwrap();
        assert_eq!(failed.status, QueueItemStatus::Failed);
        assert_eq!(failed.retry_count, 3);
    }

    #[test]
    fn sweeper_recovers_items_stranded_by_a_crashed_worker() {
        let h = setup();
        let batch = h.directory.seed_ready_batch(h.tenant, 5);
        let run_id = h.service.initiate_generation(h.tenant, batch, false).unwrap();

        // A worker claims two items and then "crashes": backdate its leases.
        let crashed = WorkerId::new();
        let stranded = h.store.claim_batch(Some(h.tenant), crashed, 2).unwrap();
        assert_eq!(stranded.len(), 2);
        for mut item in stranded {
            item.claimed_at = Some(Utc::now() - chrono::Duration::minutes(10));
            h.store.update_item(&item).unwrap();
        }

        let sweeper = LeaseSweeper::new(
            h.store.clone(),
            SweeperConfig::default().with_lease_timeout(chrono::Duration::minutes(5)),
        )
        .with_retry_policy(RetryPolicy::fixed(3, Duration::ZERO));
        let outcome = sweeper.sweep_once().unwrap();
        assert_eq!(outcome.expired, 2);
        assert_eq!(outcome.requeued, 2);

        // A healthy worker picks everything up and the run completes.
        drain(&h);
        let run = h.service.get_run(h.tenant, run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.succeeded_count, 5);

        // The swept items carry the lease expiry in their history.
        let items = h
            .service
            .list_queue_items(h.tenant, run_id, &ItemFilter::default(), Pagination::new(Some(100), None))
            .unwrap();
        let swept: Vec<_> = items.iter().filter(|i| i.retry_count == 1).collect();
        assert_eq!(swept.len(), 2);
        assert!(swept
            .iter()
            .all(|i| i.error_history[0].error_type == payrun_payroll::ErrorType::LeaseExpired));
    }

    #[test]
    fn zombie_worker_cannot_finalize_a_reclaimed_item() {
        let h = setup();
        let batch = h.directory.seed_ready_batch(h.tenant, 2);
        let run_id = h.service.initiate_generation(h.tenant, batch, false).unwrap();

        // A slow worker claims one item and stalls past its lease.
        let zombie = WorkerId::new();
        let mut stale = h.store.claim_batch(Some(h.tenant), zombie, 1).unwrap().remove(0);
        stale.claimed_at = Some(Utc::now() - chrono::Duration::minutes(10));
        h.store.update_item(&stale).unwrap();

        let sweeper = LeaseSweeper::new(
            h.store.clone(),
            SweeperConfig::default().with_lease_timeout(chrono::Duration::minutes(5)),
        )
        .with_retry_policy(RetryPolicy::fixed(3, Duration::ZERO));
        assert_eq!(sweeper.sweep_once().unwrap().requeued, 1);

        // Healthy workers finish the whole run.
        drain(&h);
        let run = h.service.get_run(h.tenant, run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.succeeded_count, 2);

        // The stalled worker wakes up and reports success from its stale
        // snapshot. The store fences the write; without the fence the run
        // would double-count the item and terminate with inflated counters.
        let now = Utc::now();
        stale.mark_processing(now).unwrap();
        stale
            .mark_completed(
                ArtifactReceipt {
                    file_hash: "stale".into(),
                    file_size_bytes: 1,
                },
                now,
            )
            .unwrap();
        let err = h.store.finalize_success(&stale).unwrap_err();
        assert!(matches!(err, QueueStoreError::OwnershipLost(_)));

        let run = h.service.get_run(h.tenant, run_id).unwrap();
        assert_eq!(run.processed_count, 2);
        assert_eq!(run.succeeded_count, 2);
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[test]
    fn force_regenerate_bumps_file_version_and_keeps_old_artifacts() {
        let h = setup();
        let batch = h.directory.seed_ready_batch(h.tenant, 4);

        let first = h.service.initiate_generation(h.tenant, batch, false).unwrap();
        drain(&h);
        assert_eq!(h.service.get_run(h.tenant, first).unwrap().file_version, 1);
        assert_eq!(h.artifacts.len(), 4);

        let second = h.service.initiate_generation(h.tenant, batch, true).unwrap();
        let run = h.service.get_run(h.tenant, second).unwrap();
        assert_eq!(run.file_version, 2);

        drain(&h);
        assert_eq!(h.service.get_run(h.tenant, second).unwrap().status, RunStatus::Completed);

        // v1 and v2 artifacts coexist at distinct paths.
        assert_eq!(h.artifacts.len(), 8);
        let v1_items = h
            .service
            .list_queue_items(h.tenant, first, &ItemFilter::default(), Pagination::new(Some(100), None))
            .unwrap();
        let bytes = h.service.download_artifact(h.tenant, v1_items[0].id).unwrap();
        assert!(!bytes.is_empty());
    }

    #[test]
    fn concurrent_claimants_never_share_an_item() {
        let h = setup();
        let batch = h.directory.seed_ready_batch(h.tenant, 60);
        h.service.initiate_generation(h.tenant, batch, false).unwrap();

        let mut handles = Vec::new();
        for _ in 0..6 {
            let store = h.store.clone();
            let tenant = h.tenant;
            handles.push(thread::spawn(move || {
                let worker = WorkerId::new();
                let mut mine = Vec::new();
                loop {
                    let claimed = store.claim_batch(Some(tenant), worker, 5).unwrap();
                    if claimed.is_empty() {
                        break;
                    }
                    mine.extend(claimed.into_iter().map(|i| i.id));
                }
                mine
            }));
        }

        let mut all: Vec<QueueItemId> = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }

        let unique: HashSet<QueueItemId> = all.iter().copied().collect();
        assert_eq!(all.len(), 60, "every item claimed exactly once");
        assert_eq!(unique.len(), 60, "no item claimed twice");
    }

    #[test]
    fn cancellation_spares_in_flight_items_and_keeps_artifacts() {
        let h = setup();
        let batch = h.directory.seed_ready_batch(h.tenant, 5);
        let run_id = h.service.initiate_generation(h.tenant, batch, false).unwrap();

        // Two items are mid-flight with a worker when the cancel lands.
        let worker = WorkerId::new();
        let in_flight = h.store.claim_batch(Some(h.tenant), worker, 2).unwrap();
        let run = h.service.cancel_run(h.tenant, run_id).unwrap();
        assert_eq!(run.cancelled_count, 3);
        assert!(!run.status.is_terminal());

        // The in-flight items finish naturally.
        for mut item in in_flight {
            let now = Utc::now();
            item.mark_processing(now).unwrap();
            item.mark_completed(
                ArtifactReceipt {
                    file_hash: "h".into(),
                    file_size_bytes: 1,
                },
                now,
            )
            .unwrap();
            h.store.finalize_success(&item).unwrap();
        }

        let run = h.service.get_run(h.tenant, run_id).unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.succeeded_count, 2);
        assert_eq!(run.cancelled_count, 3);

        let stats = h.service.stats(h.tenant).unwrap();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.cancelled, 3);
    }

    #[test]
    fn metrics_reflect_the_hour_end_to_end() {
        let h = setup();
        let batch = h.directory.seed_ready_batch(h.tenant, 6);
        let run_id = h.service.initiate_generation(h.tenant, batch, false).unwrap();

        let items = h
            .service
            .list_queue_items(h.tenant, run_id, &ItemFilter::default(), Pagination::new(Some(100), None))
            .unwrap();
        h.render.fail_employee(items[0].employee_id);
        drain(&h);

        let aggregator = MetricsAggregator::new(h.store.clone());
        let hour = hour_floor(Utc::now());
        aggregator.aggregate_all(hour).unwrap();

        let buckets = h
            .service
            .list_metrics(
                h.tenant,
                MetricRange {
                    from: hour,
                    to: hour + chrono::Duration::hours(1),
                },
            )
            .unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].total_processed, 6);
        assert_eq!(buckets[0].total_succeeded, 5);
        assert_eq!(buckets[0].total_failed, 1);
        // Only succeeded items carry processing times; the percentiles come
        // from those five samples.
        assert!(buckets[0].p50_processing_time_ms <= buckets[0].p99_processing_time_ms);
    }

    #[test]
    fn spawned_worker_and_sweeper_run_a_batch_to_completion() {
        let h = setup();
        let batch = h.directory.seed_ready_batch(h.tenant, 8);
        let run_id = h.service.initiate_generation(h.tenant, batch, false).unwrap();

        let worker = GenerationWorker::new(h.store.clone(), h.render.clone(), h.artifacts.clone())
            .with_retry_policy(RetryPolicy::fixed(3, Duration::ZERO));
        let worker_handle = worker.spawn(crate::worker::WorkerConfig::default().with_tenant(h.tenant));
        let sweeper_handle = LeaseSweeper::new(h.store.clone(), SweeperConfig::default()).spawn();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let run = h.service.get_run(h.tenant, run_id).unwrap();
            if run.status == RunStatus::Completed {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "run did not complete in time");
            thread::sleep(Duration::from_millis(10));
        }

        worker_handle.shutdown();
        sweeper_handle.shutdown();
    }
}
