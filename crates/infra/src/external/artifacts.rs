//! Durable content-addressable artifact storage.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use super::render::RenderedDocument;

/// Metadata returned by existence checks and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMetadata {
    pub content_hash: String,
    pub size_bytes: u64,
}

#[derive(Debug, Error)]
pub enum ArtifactStoreError {
    #[error("artifact store write failed: {0}")]
    WriteFailed(String),

    #[error("artifact store read failed: {0}")]
    ReadFailed(String),
}

/// Blob storage keyed by storage path.
///
/// `head` is the idempotency primitive: a worker checks it before rendering
/// and treats an existing artifact as the completed result.
pub trait ArtifactStore: Send + Sync {
    /// Write a rendered document at the given path. Overwriting the same path
    /// with the same content is harmless.
    fn put(
        &self,
        path: &str,
        document: &RenderedDocument,
    ) -> Result<ArtifactMetadata, ArtifactStoreError>;

    /// Existence check with metadata; `None` when no artifact is stored.
    fn head(&self, path: &str) -> Result<Option<ArtifactMetadata>, ArtifactStoreError>;

    /// Full read for downloads.
    fn get(&self, path: &str) -> Result<Option<Vec<u8>>, ArtifactStoreError>;
}

impl<A> ArtifactStore for std::sync::Arc<A>
where
    A: ArtifactStore + ?Sized,
{
    fn put(
        &self,
        path: &str,
        document: &RenderedDocument,
    ) -> Result<ArtifactMetadata, ArtifactStoreError> {
        (**self).put(path, document)
    }

    fn head(&self, path: &str) -> Result<Option<ArtifactMetadata>, ArtifactStoreError> {
        (**self).head(path)
    }

    fn get(&self, path: &str) -> Result<Option<Vec<u8>>, ArtifactStoreError> {
        (**self).get(path)
    }
}

#[derive(Debug, Clone)]
struct StoredArtifact {
    bytes: Vec<u8>,
    content_hash: String,
}

/// In-memory artifact store for tests/dev, with a failure toggle for
/// exercising the storage branch of the retry policy.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    blobs: RwLock<HashMap<String, StoredArtifact>>,
    fail_writes: AtomicBool,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail (reads keep working).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.blobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn put(
        &self,
        path: &str,
        document: &RenderedDocument,
    ) -> Result<ArtifactMetadata, ArtifactStoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ArtifactStoreError::WriteFailed(
                "synthetic write failure".to_string(),
            ));
        }
        let mut blobs = self.blobs.write().unwrap();
        blobs.insert(
            path.to_string(),
            StoredArtifact {
                bytes: document.bytes.clone(),
                content_hash: document.content_hash.clone(),
            },
        );
        Ok(ArtifactMetadata {
            content_hash: document.content_hash.clone(),
            size_bytes: document.bytes.len() as u64,
        })
    }

    fn head(&self, path: &str) -> Result<Option<ArtifactMetadata>, ArtifactStoreError> {
        let blobs = self.blobs.read().unwrap();
        Ok(blobs.get(path).map(|a| ArtifactMetadata {
            content_hash: a.content_hash.clone(),
            size_bytes: a.bytes.len() as u64,
        }))
    }

    fn get(&self, path: &str) -> Result<Option<Vec<u8>>, ArtifactStoreError> {
        let blobs = self.blobs.read().unwrap();
        Ok(blobs.get(path).map(|a| a.bytes.clone()))
    }
}
