//! Shared data model for the ingestion pipeline (§4.H): sections, chunks,
//! and the configuration that drives chunking/enrichment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Markdown,
    Code,
    Table,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkVariant {
    Raw,
    Enriched,
}

/// One ATX-heading-delimited section of a normalized document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub heading: String,
    pub level: u8,
    pub heading_path: String,
    pub content: String,
    pub start_char: usize,
    pub end_char: usize,
    pub start_line: usize,
    pub end_line: usize,
}

/// A single chunk produced by the splitter, before enrichment/embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawChunk {
    pub chunk_index: usize,
    pub text: String,
    pub start_char: usize,
    pub end_char: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub heading_path: String,
    pub content_type: ContentType,
    pub language: Option<String>,
}

/// Parsed enrichment output (§4.H step 4), before rendering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichmentResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub possible_queries: Vec<String>,
}

/// Everything known about a chunk right before it is upserted into the
/// vector store, mirroring the metadata shape in §4.H step 6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub doc_id: String,
    pub source_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_author: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub doc_tags: Vec<String>,
    pub version: String,
    pub heading_path: String,
    pub chunk_index: usize,
    pub start_char: usize,
    pub end_char: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub content_type: ContentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub parent_id: String,
    pub chunk_variant: ChunkVariant,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vectorized_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrichment_prompt_version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub indexed_at: DateTime<Utc>,
}

/// Knobs that control chunking and enrichment, sourced from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub target_tokens: usize,
    pub overlap_tokens: usize,
    pub llm_augmented_chunking: bool,
    pub enrichment_prompt_version: String,
    pub enrichment_content_flags: Vec<String>,
    pub max_output_chars: usize,
    pub embedding_model: String,
    pub enrichment_model: String,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            target_tokens: 500,
            overlap_tokens: 50,
            llm_augmented_chunking: false,
            enrichment_prompt_version: "v1".to_string(),
            enrichment_content_flags: vec![
                "source".to_string(),
                "heading_path".to_string(),
                "summary".to_string(),
                "key_points".to_string(),
                "keywords".to_string(),
            ],
            max_output_chars: 8000,
            embedding_model: "text-embedding-3-small".to_string(),
            enrichment_model: "gpt-4o-mini".to_string(),
        }
    }
}

/// Result of a completed ingestion run, aggregated at the Finalize phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionResult {
    pub doc_id: String,
    pub chunk_count: usize,
    pub total_tokens: Option<u64>,
    pub total_cost_usd: Option<f64>,
    pub processed_at: DateTime<Utc>,
}

/// Approximates tokens as `ceil(chars / 4)` (§4.H step 3) — a documented
/// estimator, not a real tokenizer.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
