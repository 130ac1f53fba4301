//! Document ingestion pipeline (§4.H): normalization, section parsing,
//! chunking, optional LLM enrichment, and embedding/storage.

pub mod chunker;
pub mod enrich;
pub mod pipeline;
pub mod sections;
pub mod types;

pub use pipeline::{run_with_status_recovery, Pipeline, PipelineInput};
pub use types::{
    ChunkMetadata, ChunkVariant, ContentType, EnrichmentResult, IngestionConfig, IngestionResult, RawChunk, Section,
};
