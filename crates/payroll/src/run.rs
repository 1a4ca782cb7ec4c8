//! Run aggregate: one generation attempt over a batch of employees.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use payrun_core::{BatchId, DomainError, DomainResult, RunId, TenantId};

use crate::item::ErrorType;

/// Run lifecycle.
///
/// `Completed`, `Failed`, `Partial` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, no item claimed yet
    Pending,
    /// At least one item claimed
    InProgress,
    /// Every item succeeded
    Completed,
    /// Every item failed
    Failed,
    /// Mixed outcome
    Partial,
    /// Cancellation requested; at least one item was cancelled
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::InProgress)
    }
}

/// One generation attempt over a batch.
///
/// Counters obey `processed_count == succeeded_count + failed_count` and
/// `processed_count + cancelled_count <= total_employees` at all times; they
/// only ever increase. The derived status is recomputed transactionally on
/// every terminal item transition, never by polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub tenant_id: TenantId,
    pub batch_id: BatchId,
    pub status: RunStatus,
    /// Fixed at creation; the item set never grows after that
    pub total_employees: u64,
    pub processed_count: u64,
    pub succeeded_count: u64,
    pub failed_count: u64,
    pub cancelled_count: u64,
    /// Version shared by every item in this run
    pub file_version: u32,
    /// Aggregate error counts keyed by error type
    pub error_summary: BTreeMap<String, u64>,
    pub avg_processing_time_ms: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Advisory only, recomputed opportunistically
    pub estimated_completion_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Run {
    pub fn new(
        tenant_id: TenantId,
        batch_id: BatchId,
        total_employees: u64,
        file_version: u32,
    ) -> Self {
        Self {
            id: RunId::new(),
            tenant_id,
            batch_id,
            status: RunStatus::Pending,
            total_employees,
            processed_count: 0,
            succeeded_count: 0,
            failed_count: 0,
            cancelled_count: 0,
            file_version,
            error_summary: BTreeMap::new(),
            avg_processing_time_ms: None,
            started_at: None,
            completed_at: None,
            estimated_completion_at: None,
            created_at: Utc::now(),
        }
    }

    /// Terminal items accounted for so far (processed or cancelled).
    pub fn settled_count(&self) -> u64 {
        self.processed_count + self.cancelled_count
    }

    /// First successful claim against the run: `Pending → InProgress`.
    /// Idempotent for subsequent claims.
    pub fn note_claimed(&mut self, now: DateTime<Utc>) {
        if self.status == RunStatus::Pending {
            self.status = RunStatus::InProgress;
            self.started_at = Some(now);
        }
    }

    /// Account for one item reaching `Completed`.
    pub fn record_success(&mut self, processing_time_ms: u64, now: DateTime<Utc>) -> DomainResult<()> {
        self.check_capacity()?;
        self.processed_count += 1;
        self.succeeded_count += 1;
        let n = self.succeeded_count as f64;
        let prev = self.avg_processing_time_ms.unwrap_or(0.0);
        self.avg_processing_time_ms = Some(prev + (processing_time_ms as f64 - prev) / n);
        self.derive_status(now);
        Ok(())
    }

    /// Account for one item reaching `Failed` (retries exhausted).
    pub fn record_failure(&mut self, error_type: ErrorType, now: DateTime<Utc>) -> DomainResult<()> {
        self.check_capacity()?;
        self.processed_count += 1;
        self.failed_count += 1;
        *self
            .error_summary
            .entry(error_type.as_str().to_string())
            .or_insert(0) += 1;
        self.derive_status(now);
        Ok(())
    }

    /// Shift one previously-failed item to succeeded after an operator-driven
    /// manual retry completed.
    ///
    /// This is the one documented exception to counter monotonicity: the item
    /// was already counted as processed+failed when it exhausted its budget,
    /// so a later reprocess moves the count between outcome columns without
    /// touching `processed_count`.
    pub fn record_reprocessed_success(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.failed_count == 0 {
            return Err(DomainError::invariant(format!(
                "run {}: reprocessed success with no failed items",
                self.id
            )));
        }
        self.failed_count -= 1;
        self.succeeded_count += 1;
        self.derive_status(now);
        Ok(())
    }

    /// Account for items cancelled before they were claimed.
    pub fn record_cancelled(&mut self, count: u64, now: DateTime<Utc>) -> DomainResult<()> {
        if self.settled_count() + count > self.total_employees {
            return Err(DomainError::invariant(format!(
                "run {}: cancelling {count} items would exceed total_employees",
                self.id
            )));
        }
        self.cancelled_count += count;
        self.derive_status(now);
        Ok(())
    }

    /// Recompute the advisory completion estimate from the running average.
    pub fn update_estimate(&mut self, now: DateTime<Utc>, active_worker_count: u64) {
        if self.status.is_terminal() || active_worker_count == 0 {
            self.estimated_completion_at = None;
            return;
        }
        let Some(avg) = self.avg_processing_time_ms else {
            return;
        };
        let remaining = self.total_employees - self.processed_count - self.cancelled_count;
        let remaining_ms = avg * remaining as f64 / active_worker_count as f64;
        self.estimated_completion_at =
            now.checked_add_signed(chrono::Duration::milliseconds(remaining_ms as i64));
    }

    fn check_capacity(&self) -> DomainResult<()> {
        if self.settled_count() >= self.total_employees {
            return Err(DomainError::invariant(format!(
                "run {}: processed_count would exceed total_employees ({})",
                self.id, self.total_employees
            )));
        }
        Ok(())
    }

    fn derive_status(&mut self, now: DateTime<Utc>) {
        if self.settled_count() < self.total_employees {
            return;
        }
        self.status = if self.cancelled_count > 0 {
            RunStatus::Cancelled
        } else if self.failed_count == 0 {
            RunStatus::Completed
        } else if self.failed_count == self.total_employees {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        };
        self.completed_at = Some(now);
        self.estimated_completion_at = None;
    }
}
