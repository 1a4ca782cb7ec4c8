//! Lease sweeper: reclaims items stranded by crashed or stalled workers.
//!
//! An item sitting in `Claimed` or `Processing` past the lease timeout is
//! presumed orphaned. The sweeper pushes it through the same failure path a
//! worker would use, so a sweep consumes one retry and exhausted items are
//! dead-lettered with their full history.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, warn};

use payrun_payroll::{FailureDisposition, ItemError, RetryPolicy};

use crate::queue_store::QueueStore;
use crate::worker::{WorkerError, apply_item_failure};

/// Sweeper configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// In-flight items older than this are considered orphaned
    pub lease_timeout: chrono::Duration,
    /// How often to scan for expired leases
    pub sweep_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            lease_timeout: chrono::Duration::minutes(5),
            sweep_interval: Duration::from_secs(30),
            name: "lease-sweeper".to_string(),
        }
    }
}

impl SweeperConfig {
    pub fn with_lease_timeout(mut self, lease_timeout: chrono::Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }
}

/// Handle to control a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<SweeperStats>>,
}

impl SweeperHandle {
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> SweeperStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Sweeper runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SweeperStats {
    pub sweeps: u64,
    pub leases_reclaimed: u64,
    pub items_dead_lettered: u64,
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub expired: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
}

/// Scans for expired leases and recycles them through the failure path.
pub struct LeaseSweeper<S> {
    store: S,
    config: SweeperConfig,
    retry_policy: RetryPolicy,
}

impl<S> LeaseSweeper<S>
where
    S: QueueStore,
{
    pub fn new(store: S, config: SweeperConfig) -> Self {
        Self {
            store,
            config,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// One sweep pass over all tenants.
    pub fn sweep_once(&self) -> Result<SweepOutcome, WorkerError> {
        let now = Utc::now();
        let expired = self.store.expired_leases(now, self.config.lease_timeout)?;
        let mut outcome = SweepOutcome {
            expired: expired.len(),
            ..Default::default()
        };

        for item in expired {
            let worker = item
                .worker_id
                .map(|w| w.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            warn!(
                item_id = %item.id,
                worker_id = %worker,
                status = ?item.status,
                "lease expired, reclaiming item"
            );
            let error = ItemError::lease_expired(format!(
                "lease expired after {}s on worker {}",
                self.config.lease_timeout.num_seconds(),
                worker
            ));
            // The failure write is fenced: if the worker finished (or the
            // item changed hands) between the scan and this write, the store
            // rejects the stale snapshot and the sweep skips the item.
            match apply_item_failure(&self.store, item, error, &self.retry_policy)? {
                Some(FailureDisposition::Requeued) => outcome.requeued += 1,
                Some(FailureDisposition::Exhausted) => outcome.dead_lettered += 1,
                None => {}
            }
        }
        Ok(outcome)
    }

    /// Spawn the sweeper loop in a background thread.
    pub fn spawn(self) -> SweeperHandle
    where
        S: 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(SweeperStats::default()));
        let stats_clone = stats.clone();

        let name = self.config.name.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || {
                sweeper_loop(self, shutdown_rx, stats_clone);
            })
            .expect("failed to spawn lease sweeper thread");

        SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

fn sweeper_loop<S>(
    sweeper: LeaseSweeper<S>,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<SweeperStats>>,
) where
    S: QueueStore,
{
    info!(sweeper = %sweeper.config.name, "lease sweeper started");
    let interval = sweeper.config.sweep_interval;

    loop {
        // Sleep in small slices so shutdown stays responsive.
        let wake = Instant::now() + interval;
        while Instant::now() < wake {
            if shutdown_rx.try_recv().is_ok() {
                info!(sweeper = %sweeper.config.name, "lease sweeper stopped");
                return;
            }
            thread::sleep(Duration::from_millis(50).min(interval));
        }

        match sweeper.sweep_once() {
            Ok(outcome) => {
                let mut s = stats.lock().unwrap();
                s.sweeps += 1;
                s.leases_reclaimed += outcome.requeued as u64;
                s.items_dead_lettered += outcome.dead_lettered as u64;
            }
            Err(e) => {
                error!(sweeper = %sweeper.config.name, error = ?e, "sweep failed");
            }
        }
    }
}
