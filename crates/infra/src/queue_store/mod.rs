//! Durable queue store boundary.
//!
//! This module defines the infrastructure-facing abstraction over the four
//! persisted collections (runs, queue items, dead letters, metric buckets)
//! without making storage assumptions. The claim operation is the single
//! mutual-exclusion point of the whole pipeline and must be linearizable.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryQueueStore;
pub use postgres::PostgresQueueStore;
pub use query::{DeadLetterFilter, ItemFilter, MetricRange, Pagination, RunFilter};
pub use r#trait::{QueueStats, QueueStore, QueueStoreError};
