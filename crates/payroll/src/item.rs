//! Queue item state machine: one employee's payslip within one run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use payrun_core::{DomainError, DomainResult, EmployeeId, QueueItemId, RunId, TenantId, WorkerId};

use crate::retry::RetryPolicy;

/// Queue item lifecycle.
///
/// `Pending → Claimed → Processing → {Completed | Pending(retry) | Failed}`.
/// `Cancelled` is reachable only from `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    /// Waiting to be claimed by a worker
    Pending,
    /// Claimed by a worker, render not yet started
    Claimed,
    /// Render/storage in progress
    Processing,
    /// Artifact generated and stored
    Completed,
    /// Retries exhausted, dead-lettered
    Failed,
    /// Run was cancelled before this item was claimed
    Cancelled,
}

impl QueueItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States covered by the lease sweeper.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Claimed | Self::Processing)
    }
}

/// Classification of a failed generation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// The render engine rejected or timed out on the employee's document
    Render,
    /// The artifact store failed to persist the document
    Storage,
    /// An upstream dependency was unavailable
    DependencyUnavailable,
    /// The item sat in Claimed/Processing past the lease timeout
    LeaseExpired,
    /// Anything not classified above
    Other,
}

impl ErrorType {
    /// Stable key used in run-level error summaries and metric rollups.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Render => "render",
            Self::Storage => "storage",
            Self::DependencyUnavailable => "dependency_unavailable",
            Self::LeaseExpired => "lease_expired",
            Self::Other => "other",
        }
    }
}

/// One failed attempt, kept in order on the item and carried into the
/// dead letter on exhaustion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-indexed attempt number (initial attempt = 1)
    pub attempt: u32,
    pub error_type: ErrorType,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Error raised by a worker (or synthesized by the sweeper) for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    pub error_type: ErrorType,
    pub message: String,
    pub details: Option<String>,
}

impl ItemError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn render(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Render, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Storage, message)
    }

    pub fn lease_expired(message: impl Into<String>) -> Self {
        Self::new(ErrorType::LeaseExpired, message)
    }
}

/// Deterministic identifier for one logical unit of work.
///
/// Derived from `(run_id, employee_id, file_version)`; re-processing the same
/// unit always produces the same key, so the artifact store can be used to
/// short-circuit duplicate renders.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(run_id: RunId, employee_id: EmployeeId, file_version: u32) -> Self {
        Self(format!(
            "{}:{}:v{}",
            run_id.as_uuid().simple(),
            employee_id.as_uuid().simple(),
            file_version
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for IdempotencyKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of storing a rendered document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactReceipt {
    pub file_hash: String,
    pub file_size_bytes: u64,
}

/// Disposition decided by the centralized failure path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Retry budget remains: item returned to Pending with a backoff delay
    Requeued,
    /// Retries exhausted: item is Failed and must be dead-lettered
    Exhausted,
}

/// One unit of work: one employee within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub employee_id: EmployeeId,
    pub status: QueueItemStatus,
    pub idempotency_key: IdempotencyKey,
    /// Content-addressable location of the artifact; fixed at creation so
    /// repeated attempts target the same path
    pub storage_path: String,
    pub file_version: u32,
    pub file_hash: Option<String>,
    pub file_size_bytes: Option<u64>,
    pub worker_id: Option<WorkerId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Backoff gate: the item is not claimable before this instant
    pub eligible_at: Option<DateTime<Utc>>,
    /// Number of retries performed (excludes the initial attempt)
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
    pub error_type: Option<ErrorType>,
    pub error_history: Vec<AttemptRecord>,
    pub processing_time_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl QueueItem {
    /// Create a fresh pending item for one employee in one run.
    pub fn new(
        tenant_id: TenantId,
        run_id: RunId,
        employee_id: EmployeeId,
        file_version: u32,
        max_retries: u32,
    ) -> Self {
        let idempotency_key = IdempotencyKey::derive(run_id, employee_id, file_version);
        let storage_path = format!(
            "payslips/{}/{}.pdf",
            tenant_id.as_uuid().simple(),
            idempotency_key
        );

        Self {
            id: QueueItemId::new(),
            tenant_id,
            run_id,
            employee_id,
            status: QueueItemStatus::Pending,
            idempotency_key,
            storage_path,
            file_version,
            file_hash: None,
            file_size_bytes: None,
            worker_id: None,
            claimed_at: None,
            started_at: None,
            completed_at: None,
            eligible_at: None,
            retry_count: 0,
            max_retries,
            error_message: None,
            error_details: None,
            error_type: None,
            error_history: Vec::new(),
            processing_time_ms: None,
            created_at: Utc::now(),
        }
    }

    /// 1-indexed number of the attempt currently (or about to be) running.
    pub fn attempt_number(&self) -> u32 {
        self.retry_count + 1
    }

    /// Whether the item can be handed to a worker right now.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueItemStatus::Pending
            && self.eligible_at.map_or(true, |at| now >= at)
    }

    /// Whether an in-flight claim has outlived its lease.
    pub fn lease_expired(&self, now: DateTime<Utc>, lease_timeout: chrono::Duration) -> bool {
        if !self.status.is_in_flight() {
            return false;
        }
        // Processing items are judged from started_at, claimed-but-never-started
        // from claimed_at; both are swept identically.
        let anchor = match self.status {
            QueueItemStatus::Processing => self.started_at.or(self.claimed_at),
            _ => self.claimed_at,
        };
        anchor.map_or(false, |at| now - at > lease_timeout)
    }

    /// Claim transition: `Pending → Claimed`.
    pub fn mark_claimed(&mut self, worker_id: WorkerId, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != QueueItemStatus::Pending {
            return Err(DomainError::illegal_transition(format!(
                "claim requires Pending, item {} is {:?}",
                self.id, self.status
            )));
        }
        self.status = QueueItemStatus::Claimed;
        self.worker_id = Some(worker_id);
        self.claimed_at = Some(now);
        Ok(())
    }

    /// Start transition: `Claimed → Processing`, recorded before the render begins.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != QueueItemStatus::Claimed {
            return Err(DomainError::illegal_transition(format!(
                "processing requires Claimed, item {} is {:?}",
                self.id, self.status
            )));
        }
        self.status = QueueItemStatus::Processing;
        self.started_at = Some(now);
        Ok(())
    }

    /// Success transition: `Claimed|Processing → Completed`.
    pub fn mark_completed(
        &mut self,
        receipt: ArtifactReceipt,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if !self.status.is_in_flight() {
            return Err(DomainError::illegal_transition(format!(
                "complete requires an in-flight item, item {} is {:?}",
                self.id, self.status
            )));
        }
        let anchor = self.started_at.or(self.claimed_at).unwrap_or(now);
        self.processing_time_ms = Some((now - anchor).num_milliseconds().max(0) as u64);
        self.status = QueueItemStatus::Completed;
        self.file_hash = Some(receipt.file_hash);
        self.file_size_bytes = Some(receipt.file_size_bytes);
        self.completed_at = Some(now);
        Ok(())
    }

    /// Centralized failure path, shared by workers and the lease sweeper.
    ///
    /// Appends the attempt to `error_history` and either requeues the item
    /// (retry budget remains, backoff applied) or finalizes it as `Failed`.
    pub fn record_failure(
        &mut self,
        error: ItemError,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> DomainResult<FailureDisposition> {
        if !self.status.is_in_flight() {
            return Err(DomainError::illegal_transition(format!(
                "failure requires an in-flight item, item {} is {:?}",
                self.id, self.status
            )));
        }

        self.error_history.push(AttemptRecord {
            attempt: self.attempt_number(),
            error_type: error.error_type,
            message: error.message.clone(),
            occurred_at: now,
        });
        self.error_message = Some(error.message);
        self.error_details = error.details;
        self.error_type = Some(error.error_type);

        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.status = QueueItemStatus::Pending;
            self.worker_id = None;
            self.claimed_at = None;
            self.started_at = None;
            self.eligible_at = now
                .checked_add_signed(
                    chrono::Duration::from_std(policy.delay_for_retry(self.retry_count))
                        .unwrap_or_else(|_| chrono::Duration::zero()),
                );
            Ok(FailureDisposition::Requeued)
        } else {
            self.status = QueueItemStatus::Failed;
            self.completed_at = Some(now);
            Ok(FailureDisposition::Exhausted)
        }
    }

    /// Total attempts performed, as recorded in the dead letter.
    pub fn total_attempts(&self) -> u32 {
        self.retry_count + 1
    }

    /// Cancellation: `Pending → Cancelled`. In-flight items finish naturally.
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != QueueItemStatus::Pending {
            return Err(DomainError::illegal_transition(format!(
                "cancel requires Pending, item {} is {:?}",
                self.id, self.status
            )));
        }
        self.status = QueueItemStatus::Cancelled;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Operator-initiated requeue of a `Failed` item.
    ///
    /// Resets the retry budget to zero and clears per-item error fields so the
    /// item gets a full fresh budget; `error_history` is preserved for
    /// forensics.
    pub fn reset_for_manual_retry(&mut self) -> DomainResult<()> {
        if self.status != QueueItemStatus::Failed {
            return Err(DomainError::illegal_transition(format!(
                "manual retry requires Failed, item {} is {:?}",
                self.id, self.status
            )));
        }
        self.status = QueueItemStatus::Pending;
        self.retry_count = 0;
        self.worker_id = None;
        self.claimed_at = None;
        self.started_at = None;
        self.completed_at = None;
        self.eligible_at = None;
        self.error_message = None;
        self.error_details = None;
        self.error_type = None;
        Ok(())
    }
}
