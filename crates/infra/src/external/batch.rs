//! Upstream payroll batch collaborator.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use payrun_core::{BatchId, EmployeeId, TenantId};

/// What the coordinator needs to know about a batch: whether the upstream
/// payroll computation finished, and who is in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSnapshot {
    pub batch_id: BatchId,
    /// Terminal "ready" state upstream; generation may only start then
    pub ready: bool,
    pub employee_ids: Vec<EmployeeId>,
}

#[derive(Debug, Error)]
pub enum BatchDirectoryError {
    #[error("batch directory unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view over upstream batches.
pub trait BatchDirectory: Send + Sync {
    fn batch(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<Option<BatchSnapshot>, BatchDirectoryError>;
}

/// In-memory batch directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryBatchDirectory {
    batches: RwLock<HashMap<(TenantId, BatchId), BatchSnapshot>>,
}

impl InMemoryBatchDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant_id: TenantId, snapshot: BatchSnapshot) {
        let mut batches = self.batches.write().unwrap();
        batches.insert((tenant_id, snapshot.batch_id), snapshot);
    }

    /// Seed a ready batch with `count` fresh employees and return its ID.
    pub fn seed_ready_batch(&self, tenant_id: TenantId, count: usize) -> BatchId {
        let batch_id = BatchId::new();
        self.insert(
            tenant_id,
            BatchSnapshot {
                batch_id,
                ready: true,
                employee_ids: (0..count).map(|_| EmployeeId::new()).collect(),
            },
        );
        batch_id
    }
}

impl BatchDirectory for InMemoryBatchDirectory {
    fn batch(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<Option<BatchSnapshot>, BatchDirectoryError> {
        let batches = self.batches.read().unwrap();
        Ok(batches.get(&(tenant_id, batch_id)).cloned())
    }
}

impl<B> BatchDirectory for std::sync::Arc<B>
where
    B: BatchDirectory + ?Sized,
{
    fn batch(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
    ) -> Result<Option<BatchSnapshot>, BatchDirectoryError> {
        (**self).batch(tenant_id, batch_id)
    }
}
