//! External collaborators the pipeline calls through narrow interfaces.
//!
//! The batch directory, render engine and artifact store are opaque to the
//! core: the pipeline only needs readiness/enumeration, an
//! employee-to-document function, and durable content-addressable blobs.

pub mod artifacts;
pub mod batch;
pub mod render;

pub use artifacts::{
    ArtifactMetadata, ArtifactStore, ArtifactStoreError, InMemoryArtifactStore,
};
pub use batch::{BatchDirectory, BatchDirectoryError, BatchSnapshot, InMemoryBatchDirectory};
pub use render::{InMemoryRenderEngine, RenderEngine, RenderError, RenderRequest, RenderedDocument};
