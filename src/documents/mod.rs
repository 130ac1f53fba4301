//! Document storage (§4.E) and document metadata (§4.F).

pub mod metadata;
pub mod storage;

pub use metadata::{DocumentMetadata, DocumentMetadataStore, DocumentStatus, ProcessingProgress, StatusPatch};
pub use storage::{create_document_id, DocumentStorage, ReadDocument};
