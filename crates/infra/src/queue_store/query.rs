//! Read-side query interface for runs, items, dead letters and metrics.
//!
//! All list operations are tenant-scoped and paginated by default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use payrun_core::{BatchId, EmployeeId, RunId};
use payrun_payroll::{QueueItemStatus, Resolution, RunStatus};

/// Pagination parameters for list queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of rows to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50, // Safe default
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(500), // Cap at 500 for safety
            offset: offset.unwrap_or(0),
        }
    }

    pub(crate) fn slice<T: Clone>(&self, mut rows: Vec<T>) -> Vec<T> {
        let start = (self.offset as usize).min(rows.len());
        let end = (start + self.limit as usize).min(rows.len());
        rows.drain(..start);
        rows.truncate(end - start);
        rows
    }
}

/// Filter criteria for run queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFilter {
    pub batch_id: Option<BatchId>,
    pub status: Option<RunStatus>,
    pub created_after: Option<DateTime<Utc>>,
}

/// Filter criteria for queue item queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemFilter {
    pub status: Option<QueueItemStatus>,
    pub employee_id: Option<EmployeeId>,
}

/// Filter criteria for dead-letter queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterFilter {
    pub resolution: Option<Resolution>,
    pub run_id: Option<RunId>,
}

/// Half-open time range for metric queries (`from` inclusive, `to` exclusive).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl MetricRange {
    pub fn contains(&self, hour_bucket: DateTime<Utc>) -> bool {
        hour_bucket >= self.from && hour_bucket < self.to
    }
}
