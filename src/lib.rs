//! Document ingestion and retrieval core.
//!
//! Uploads land in content-addressed document storage, run through an
//! ingestion pipeline (normalize → section → chunk → optional LLM
//! enrichment → embed → upsert), and become queryable through a
//! per-store vector index. A small flow engine lets callers compose
//! retrieval, generation, and tool nodes into a graph and stream its
//! execution back over SSE.
//!
//! # Example
//!
//! ```rust,no_run
//! use zoeflow_core::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     println!("embedding model: {}", config.provider.embedding_model);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod atomic_file;
pub mod cache;
pub mod config;
pub mod documents;
pub mod error;
pub mod flow;
pub mod ingestion;
pub mod llm;
pub mod operations;
pub mod registry;
pub mod status;
pub mod store;
pub mod usage;
pub mod vecmath;

pub use api::{create_router, AppState};
pub use config::Config;
pub use documents::{create_document_id, DocumentMetadata, DocumentMetadataStore, DocumentStatus, DocumentStorage};
pub use error::{CoreError, ErrorCategory, Result};
pub use flow::{EngineDeps, FlowEvent, Graph, RunOptions};
pub use ingestion::{IngestionConfig, Pipeline, PipelineInput};
pub use operations::Core;
pub use registry::ProcessingRegistry;
pub use status::{StatusBus, StatusEvent, StatusFilter};
pub use store::{QueryResult, VectorStoreBackend, VectorStoreItem};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with(char::is_numeric));
    }
}
