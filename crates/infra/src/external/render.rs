//! Opaque render capability: employee + period in, document + hash out.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};
use thiserror::Error;

use payrun_core::{EmployeeId, RunId, TenantId};
use payrun_payroll::ErrorType;

/// Everything the engine needs to produce one payslip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub employee_id: EmployeeId,
    pub file_version: u32,
}

/// A rendered document plus its content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDocument {
    pub bytes: Vec<u8>,
    /// Hex SHA-256 over the document bytes
    pub content_hash: String,
}

impl RenderedDocument {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let content_hash = format!("{:x}", Sha256::digest(&bytes));
        Self {
            bytes,
            content_hash,
        }
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render failed: {0}")]
    Failed(String),

    #[error("render timed out after {0}ms")]
    Timeout(u64),

    #[error("render engine unavailable: {0}")]
    Unavailable(String),
}

impl RenderError {
    /// Classification used for error summaries and retry bookkeeping.
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Failed(_) | Self::Timeout(_) => ErrorType::Render,
            Self::Unavailable(_) => ErrorType::DependencyUnavailable,
        }
    }
}

/// Render capability boundary. Templating, layout and PDF encoding live
/// behind this trait and are out of scope for the pipeline.
pub trait RenderEngine: Send + Sync {
    fn render(&self, request: &RenderRequest) -> Result<RenderedDocument, RenderError>;
}

impl<R> RenderEngine for std::sync::Arc<R>
where
    R: RenderEngine + ?Sized,
{
    fn render(&self, request: &RenderRequest) -> Result<RenderedDocument, RenderError> {
        (**self).render(request)
    }
}

/// Deterministic in-memory engine for tests/dev.
///
/// Produces a small synthetic document per request and counts invocations so
/// tests can assert the idempotent short-circuit. Individual employees can be
/// rigged to always fail.
#[derive(Debug, Default)]
pub struct InMemoryRenderEngine {
    render_count: AtomicU64,
    failing: RwLock<Vec<EmployeeId>>,
}

impl InMemoryRenderEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every render for this employee fail with a render error.
    pub fn fail_employee(&self, employee_id: EmployeeId) {
        self.failing.write().unwrap().push(employee_id);
    }

    /// Clear a failure rig, as if the underlying template got fixed.
    pub fn unfail_employee(&self, employee_id: EmployeeId) {
        self.failing.write().unwrap().retain(|&e| e != employee_id);
    }

    /// Number of actual renders performed (short-circuited items don't count).
    pub fn render_count(&self) -> u64 {
        self.render_count.load(Ordering::SeqCst)
    }
}

impl RenderEngine for InMemoryRenderEngine {
    fn render(&self, request: &RenderRequest) -> Result<RenderedDocument, RenderError> {
        self.render_count.fetch_add(1, Ordering::SeqCst);

        if self.failing.read().unwrap().contains(&request.employee_id) {
            return Err(RenderError::Failed(format!(
                "synthetic failure for employee {}",
                request.employee_id
            )));
        }

        let bytes = format!(
            "payslip run={} employee={} v={}",
            request.run_id, request.employee_id, request.file_version
        )
        .into_bytes();
        Ok(RenderedDocument::from_bytes(bytes))
    }
}
