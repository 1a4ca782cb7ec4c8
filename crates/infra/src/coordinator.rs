//! Run coordinator: turns a ready batch into a run plus its queue items.

use thiserror::Error;
use tracing::{info, warn};

use payrun_core::{BatchId, RunId, TenantId};
use payrun_payroll::{QueueItem, Run};

use crate::external::batch::{BatchDirectory, BatchDirectoryError};
use crate::queue_store::{QueueStore, QueueStoreError};

/// Default retry budget stamped on every created item.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum InitiateError {
    #[error("batch {0} not found")]
    BatchNotFound(BatchId),

    #[error("batch {0} is not ready for generation")]
    BatchNotReady(BatchId),

    #[error("batch {0} has no employees")]
    EmptyBatch(BatchId),

    #[error("a generation run is already in progress for batch {0}")]
    AlreadyInProgress(BatchId),

    #[error("batch directory error: {0}")]
    Directory(#[from] BatchDirectoryError),

    #[error(transparent)]
    Store(QueueStoreError),
}

impl From<QueueStoreError> for InitiateError {
    fn from(err: QueueStoreError) -> Self {
        // The store's atomic create enforces the single-active-run rule; map
        // a losing race to the same error as the synchronous pre-check.
        match err {
            QueueStoreError::ActiveRunExists(batch_id) => Self::AlreadyInProgress(batch_id),
            other => Self::Store(other),
        }
    }
}

/// Creates runs and their work items; owns no processing of its own.
pub struct RunCoordinator<S, B> {
    store: S,
    directory: B,
    max_retries: u32,
}

impl<S, B> RunCoordinator<S, B>
where
    S: QueueStore,
    B: BatchDirectory,
{
    pub fn new(store: S, directory: B) -> Self {
        Self {
            store,
            directory,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Start a generation run for a batch.
    ///
    /// Enumerates every employee in the batch, computes the file version
    /// (1 for a fresh run, previous max + 1 under `force_regenerate` so old
    /// artifacts stay retrievable), and writes the run row plus one pending
    /// item per employee in a single atomic store call. No partial state is
    /// created on rejection.
    pub fn initiate(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
        force_regenerate: bool,
    ) -> Result<RunId, InitiateError> {
        let snapshot = self
            .directory
            .batch(tenant_id, batch_id)?
            .ok_or(InitiateError::BatchNotFound(batch_id))?;
        if !snapshot.ready {
            return Err(InitiateError::BatchNotReady(batch_id));
        }
        if snapshot.employee_ids.is_empty() {
            return Err(InitiateError::EmptyBatch(batch_id));
        }

        if !force_regenerate && self.store.active_run_exists(tenant_id, batch_id)? {
            warn!(%tenant_id, %batch_id, "initiation rejected: run already active");
            return Err(InitiateError::AlreadyInProgress(batch_id));
        }

        let previous_max = self.store.max_file_version(tenant_id, batch_id)?;
        let file_version = if force_regenerate && previous_max > 0 {
            previous_max + 1
        } else {
            1
        };

        let run = Run::new(
            tenant_id,
            batch_id,
            snapshot.employee_ids.len() as u64,
            file_version,
        );
        let items: Vec<QueueItem> = snapshot
            .employee_ids
            .iter()
            .map(|&employee_id| {
                QueueItem::new(tenant_id, run.id, employee_id, file_version, self.max_retries)
            })
            .collect();

        let total = items.len();
        let run_id = self.store.create_run(run, items)?;
        info!(
            %tenant_id,
            %batch_id,
            %run_id,
            total_employees = total,
            file_version,
            "generation run initiated"
        );
        Ok(run_id)
    }
}
