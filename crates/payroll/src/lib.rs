//! Payslip-generation domain module.
//!
//! This crate contains the state machines for generation runs, queue items,
//! dead letters and metric buckets, implemented purely as deterministic domain
//! logic (no IO, no HTTP, no storage).

pub mod dead_letter;
pub mod item;
pub mod metrics;
pub mod retry;
pub mod run;

pub use dead_letter::{DeadLetterItem, Resolution};
pub use item::{
    ArtifactReceipt, AttemptRecord, ErrorType, FailureDisposition, IdempotencyKey, ItemError,
    QueueItem, QueueItemStatus,
};
pub use metrics::{CompletedSample, MetricBucket, hour_floor, percentile_nearest_rank};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use run::{Run, RunStatus};
