//! Infrastructure layer: queue store, coordinator, workers, periodic tasks.

pub mod aggregator;
pub mod coordinator;
pub mod external;
pub mod queue_store;
pub mod service;
pub mod sweeper;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use aggregator::MetricsAggregator;
pub use coordinator::{InitiateError, RunCoordinator};
pub use queue_store::{InMemoryQueueStore, QueueStore, QueueStoreError};
pub use service::{PipelineError, PipelineService};
pub use sweeper::LeaseSweeper;
pub use worker::GenerationWorker;
