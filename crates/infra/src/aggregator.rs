//! Metrics aggregator: rolls terminal items into hourly per-tenant buckets.
//!
//! Aggregation is a pure function of the terminal items in an hour, so
//! re-running it for the same hour upserts an identical row.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use payrun_core::TenantId;
use payrun_payroll::{CompletedSample, MetricBucket, QueueItemStatus, hour_floor};

use crate::queue_store::{QueueStore, QueueStoreError};

/// Aggregator configuration.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// How often the loop re-aggregates the previous hour
    pub run_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            run_interval: Duration::from_secs(300),
            name: "metrics-aggregator".to_string(),
        }
    }
}

/// Handle to control a running aggregator.
#[derive(Debug)]
pub struct AggregatorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl AggregatorHandle {
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Computes and upserts hourly metric buckets.
pub struct MetricsAggregator<S> {
    store: S,
}

impl<S> MetricsAggregator<S>
where
    S: QueueStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Aggregate one tenant's hour and upsert the bucket.
    ///
    /// Returns the bucket, or `None` when the hour had no terminal items
    /// (no row is written for empty hours).
    pub fn aggregate_hour(
        &self,
        tenant_id: TenantId,
        hour: DateTime<Utc>,
    ) -> Result<Option<MetricBucket>, QueueStoreError> {
        let hour = hour_floor(hour);
        let items = self.store.terminal_items_in_hour(tenant_id, hour)?;
        if items.is_empty() {
            return Ok(None);
        }

        let samples: Vec<CompletedSample> = items
            .iter()
            .map(|i| CompletedSample {
                succeeded: i.status == QueueItemStatus::Completed,
                processing_time_ms: i.processing_time_ms,
            })
            .collect();

        let bucket = MetricBucket::compute(tenant_id, hour, &samples);
        self.store.upsert_metric_bucket(bucket.clone())?;
        debug!(
            %tenant_id,
            hour = %hour,
            total_processed = bucket.total_processed,
            p95_ms = bucket.p95_processing_time_ms,
            "metric bucket upserted"
        );
        Ok(Some(bucket))
    }

    /// Aggregate the given hour for every tenant that had terminal activity.
    pub fn aggregate_all(&self, hour: DateTime<Utc>) -> Result<usize, QueueStoreError> {
        let hour = hour_floor(hour);
        let tenants = self.store.tenants_with_activity(hour)?;
        let mut written = 0;
        for tenant_id in tenants {
            if self.aggregate_hour(tenant_id, hour)?.is_some() {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Spawn the aggregator loop in a background thread.
    ///
    /// Each pass re-aggregates the previous full hour plus the current
    /// (partial) hour; the upsert makes reruns harmless.
    pub fn spawn(self, config: AggregatorConfig) -> AggregatorHandle
    where
        S: 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let name = config.name.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || {
                aggregator_loop(self, config, shutdown_rx);
            })
            .expect("failed to spawn metrics aggregator thread");

        AggregatorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

fn aggregator_loop<S>(
    aggregator: MetricsAggregator<S>,
    config: AggregatorConfig,
    shutdown_rx: mpsc::Receiver<()>,
) where
    S: QueueStore,
{
    info!(aggregator = %config.name, "metrics aggregator started");

    loop {
        let wake = Instant::now() + config.run_interval;
        while Instant::now() < wake {
            if shutdown_rx.try_recv().is_ok() {
                info!(aggregator = %config.name, "metrics aggregator stopped");
                return;
            }
            thread::sleep(Duration::from_millis(50).min(config.run_interval));
        }

        let now = Utc::now();
        for hour in [hour_floor(now) - chrono::Duration::hours(1), hour_floor(now)] {
            if let Err(e) = aggregator.aggregate_all(hour) {
                error!(aggregator = %config.name, hour = %hour, error = ?e, "aggregation failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::external::artifacts::InMemoryArtifactStore;
    use crate::external::render::InMemoryRenderEngine;
    use crate::queue_store::{InMemoryQueueStore, MetricRange};
    use crate::worker::GenerationWorker;
    use payrun_core::{BatchId, EmployeeId};
    use payrun_payroll::{QueueItem, RetryPolicy, Run};

    fn completed_tenant(store: &Arc<InMemoryQueueStore>, employees: usize, fail: usize) -> TenantId {
        let tenant = TenantId::new();
        let employee_ids: Vec<EmployeeId> = (0..employees).map(|_| EmployeeId::new()).collect();
        let run = Run::new(tenant, BatchId::new(), employees as u64, 1);
        let run_id = run.id;
        let items = employee_ids
            .iter()
            .map(|&e| QueueItem::new(tenant, run_id, e, 1, 0))
            .collect();
        store.create_run(run, items).unwrap();

        let render = Arc::new(InMemoryRenderEngine::new());
        for &e in employee_ids.iter().take(fail) {
            render.fail_employee(e);
        }
        let worker = GenerationWorker::new(
            store.clone(),
            render,
            Arc::new(InMemoryArtifactStore::new()),
        )
        .with_retry_policy(RetryPolicy::no_retry());
        worker.run_cycle(Some(tenant), employees).unwrap();
        tenant
    }

    #[test]
    fn aggregates_terminal_items_into_bucket() {
        let store = InMemoryQueueStore::arc();
        let tenant = completed_tenant(&store, 5, 2);

        let aggregator = MetricsAggregator::new(store.clone());
        let hour = hour_floor(Utc::now());
        let bucket = aggregator.aggregate_hour(tenant, hour).unwrap().unwrap();

        assert_eq!(bucket.total_processed, 5);
        assert_eq!(bucket.total_succeeded, 3);
        assert_eq!(bucket.total_failed, 2);

        let listed = store
            .list_metrics(
                tenant,
                MetricRange {
                    from: hour,
                    to: hour + chrono::Duration::hours(1),
                },
            )
            .unwrap();
        assert_eq!(listed, vec![bucket]);
    }

    #[test]
    fn rerun_for_same_hour_is_idempotent() {
        let store = InMemoryQueueStore::arc();
        let tenant = completed_tenant(&store, 4, 1);

        let aggregator = MetricsAggregator::new(store.clone());
        let hour = hour_floor(Utc::now());
        let first = aggregator.aggregate_hour(tenant, hour).unwrap().unwrap();
        let second = aggregator.aggregate_hour(tenant, hour).unwrap().unwrap();
        assert_eq!(first, second);

        let range = MetricRange {
            from: hour,
            to: hour + chrono::Duration::hours(1),
        };
        assert_eq!(store.list_metrics(tenant, range).unwrap().len(), 1);
    }

    #[test]
    fn empty_hour_writes_no_row() {
        let store = InMemoryQueueStore::arc();
        let tenant = TenantId::new();

        let aggregator = MetricsAggregator::new(store.clone());
        let hour = hour_floor(Utc::now());
        assert!(aggregator.aggregate_hour(tenant, hour).unwrap().is_none());
        let range = MetricRange {
            from: hour,
            to: hour + chrono::Duration::hours(1),
        };
        assert!(store.list_metrics(tenant, range).unwrap().is_empty());
    }

    #[test]
    fn aggregate_all_covers_every_active_tenant() {
        let store = InMemoryQueueStore::arc();
        let a = completed_tenant(&store, 2, 0);
        let b = completed_tenant(&store, 3, 1);

        let aggregator = MetricsAggregator::new(store.clone());
        let hour = hour_floor(Utc::now());
        let written = aggregator.aggregate_all(hour).unwrap();
        assert_eq!(written, 2);

        let range = MetricRange {
            from: hour,
            to: hour + chrono::Duration::hours(1),
        };
        assert_eq!(store.list_metrics(a, range).unwrap().len(), 1);
        assert_eq!(store.list_metrics(b, range).unwrap().len(), 1);
    }
}
