//! Ingestion pipeline orchestration (§4.H): normalize → parse sections →
//! chunk → enrich (optional) → delete stale chunks → embed + store →
//! finalize.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::embedding::EmbeddingCache;
use crate::cache::enrichment::EnrichmentCache;
use crate::documents::metadata::{DocumentMetadataStore, DocumentStatus, ProcessingProgress, StatusPatch};
use crate::error::{CoreError, Result};
use crate::ingestion::chunker::chunk_section;
use crate::ingestion::enrich::{enrich_chunks, EnrichmentContext};
use crate::ingestion::sections::{normalize, parse_sections};
use crate::ingestion::types::{ChunkMetadata, ChunkVariant, IngestionConfig, IngestionResult, RawChunk};
use crate::llm::provider::{LlmProvider, Usage};
use crate::store::{UpsertItem, VectorStoreBackend};
use crate::usage::{UsageEntry, UsageKind, UsageLedger};

pub struct PipelineInput<'a> {
    pub doc_id: &'a str,
    pub store_id: &'a str,
    pub source_uri: &'a str,
    pub content: &'a str,
    pub version: &'a str,
    pub doc_author: Option<&'a str>,
    pub doc_description: Option<&'a str>,
    pub doc_tags: &'a [String],
}

pub struct Pipeline {
    pub config: IngestionConfig,
    pub store: Arc<dyn VectorStoreBackend>,
    pub embedding_cache: Arc<EmbeddingCache>,
    pub enrichment_cache: Arc<EnrichmentCache>,
    pub metadata_store: Arc<DocumentMetadataStore>,
    pub provider: Arc<dyn LlmProvider>,
    pub usage_ledger: Arc<UsageLedger>,
}

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(CoreError::Cancelled)
    } else {
        Ok(())
    }
}

fn chunk_metadata_value(metadata: &ChunkMetadata) -> Result<HashMap<String, Value>> {
    let value = serde_json::to_value(metadata)?;
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => unreachable!("ChunkMetadata always serializes to an object"),
    }
}

fn build_default_embedded_text(ctx_source_uri: &str, doc_id: &str, version: &str, chunk: &RawChunk) -> String {
    format!(
        "Source: {ctx_source_uri}\nDocument: {doc_id}@{version}\nSection: {}\n\n{}",
        chunk.heading_path, chunk.text
    )
}

fn usage_entry(model: &str, kind: UsageKind, usage: Usage, doc_id: &str) -> UsageEntry {
    UsageEntry {
        timestamp: Utc::now(),
        model: model.to_string(),
        kind,
        prompt_tokens: Some(usage.prompt_tokens),
        completion_tokens: Some(usage.completion_tokens),
        total_tokens: Some(usage.total_tokens),
        cost_usd: None,
        doc_id: Some(doc_id.to_string()),
        run_id: None,
        internal: false,
    }
}

impl Pipeline {
    /// Runs every phase in order, updating document metadata as it goes.
    /// Returns the finalized [`IngestionResult`] on success. Cancellation
    /// raises `CoreError::Cancelled`; callers translate that into the
    /// terminal `cancelled` status while other errors become `error`.
    pub async fn run(&self, input: PipelineInput<'_>, cancel: &CancellationToken) -> Result<IngestionResult> {
        check_cancel(cancel)?;
        self.set_step(input.doc_id, "normalize", 0, 0).await?;
        let normalized = normalize(input.content);

        check_cancel(cancel)?;
        self.set_step(input.doc_id, "parse_sections", 0, 0).await?;
        let sections = parse_sections(&normalized);

        check_cancel(cancel)?;
        self.set_step(input.doc_id, "chunk", 0, 0).await?;
        let mut next_chunk_index = 0usize;
        let mut raw_chunks = Vec::new();
        for section in &sections {
            if section.content.trim().is_empty() {
                continue;
            }
            let chunks = chunk_section(
                &section.content,
                section.start_char,
                section.start_line,
                &section.heading_path,
                self.config.target_tokens,
                self.config.overlap_tokens,
                &mut next_chunk_index,
            );
            raw_chunks.extend(chunks);
        }

        if raw_chunks.is_empty() {
            self.metadata_store
                .update_document_status(
                    input.doc_id,
                    DocumentStatus::Error,
                    StatusPatch {
                        error: Some("No chunks generated from document".to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            return Err(CoreError::Validation("No chunks generated from document".to_string()));
        }

        check_cancel(cancel)?;
        let mut usage_entries: Vec<UsageEntry> = Vec::new();
        let embedded_texts = if self.config.llm_augmented_chunking {
            self.set_step(input.doc_id, "enrich", 0, raw_chunks.len() as u64).await?;
            let ctx = EnrichmentContext {
                source_uri: input.source_uri,
                doc_id: input.doc_id,
                version: input.version,
                doc_author: input.doc_author,
                doc_description: input.doc_description,
                doc_tags: input.doc_tags,
                full_document: &normalized,
            };
            let enriched = enrich_chunks(
                self.provider.clone(),
                &self.enrichment_cache,
                &self.config,
                &ctx,
                &raw_chunks,
                cancel,
            )
            .await?;
            let mut texts = Vec::with_capacity(enriched.len());
            for (text, usage) in enriched {
                texts.push(text);
                if let Some(usage) = usage {
                    usage_entries.push(usage_entry(
                        &self.config.enrichment_model,
                        UsageKind::Enrichment,
                        usage,
                        input.doc_id,
                    ));
                }
            }
            texts
        } else {
            raw_chunks
                .iter()
                .map(|c| build_default_embedded_text(input.source_uri, input.doc_id, input.version, c))
                .collect()
        };

        check_cancel(cancel)?;
        self.set_step(input.doc_id, "delete_stale", 0, 0).await?;
        self.delete_stale_chunks(input.doc_id, input.version).await?;

        check_cancel(cancel)?;
        self.set_step(input.doc_id, "embed", 0, raw_chunks.len() as u64).await?;
        let mut stored = 0u64;
        for (batch_idx, (chunk_batch, text_batch)) in raw_chunks
            .chunks(10)
            .zip(embedded_texts.chunks(10))
            .enumerate()
        {
            check_cancel(cancel)?;
            let (embeddings, embed_usage) = self.embed_batch(text_batch).await?;
            for usage in embed_usage {
                usage_entries.push(usage_entry(&self.config.embedding_model, UsageKind::Embedding, usage, input.doc_id));
            }

            let items: Vec<UpsertItem> = chunk_batch
                .iter()
                .zip(embeddings.into_iter())
                .zip(text_batch.iter())
                .map(|((chunk, embedding), embedded_text)| {
                    let now = Utc::now();
                    let metadata = ChunkMetadata {
                        doc_id: input.doc_id.to_string(),
                        source_uri: input.source_uri.to_string(),
                        doc_description: input.doc_description.map(str::to_string),
                        doc_author: input.doc_author.map(str::to_string),
                        doc_tags: input.doc_tags.to_vec(),
                        version: input.version.to_string(),
                        heading_path: chunk.heading_path.clone(),
                        chunk_index: chunk.chunk_index,
                        start_char: chunk.start_char,
                        end_char: chunk.end_char,
                        start_line: chunk.start_line,
                        end_line: chunk.end_line,
                        content_type: chunk.content_type,
                        language: chunk.language.clone(),
                        parent_id: format!("{}_{}", input.doc_id, chunk.chunk_index),
                        chunk_variant: if self.config.llm_augmented_chunking {
                            ChunkVariant::Enriched
                        } else {
                            ChunkVariant::Raw
                        },
                        vectorized_text: if self.config.llm_augmented_chunking {
                            Some(embedded_text.clone())
                        } else {
                            None
                        },
                        enrichment_prompt_version: if self.config.llm_augmented_chunking {
                            Some(self.config.enrichment_prompt_version.clone())
                        } else {
                            None
                        },
                        created_at: now,
                        indexed_at: now,
                    };

                    Ok(UpsertItem {
                        id: Some(format!("chunk_{}_{}_{}", input.doc_id, chunk.chunk_index, input.version)),
                        text: chunk.text.clone(),
                        embedding,
                        metadata: chunk_metadata_value(&metadata)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            self.store.upsert(items).await?;
            stored += chunk_batch.len() as u64;
            self.set_step(input.doc_id, "embed", stored, raw_chunks.len() as u64).await?;

            let is_last = (batch_idx + 1) * 10 >= raw_chunks.len();
            if !is_last {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
        }

        check_cancel(cancel)?;
        self.set_step(input.doc_id, "finalize", raw_chunks.len() as u64, raw_chunks.len() as u64)
            .await?;

        for entry in &usage_entries {
            self.usage_ledger.append(entry.clone()).await?;
        }
        let total_tokens: u64 = usage_entries.iter().filter_map(|e| e.total_tokens).sum();
        let processed_at = Utc::now();

        let result = IngestionResult {
            doc_id: input.doc_id.to_string(),
            chunk_count: raw_chunks.len(),
            total_tokens: if usage_entries.is_empty() { None } else { Some(total_tokens) },
            total_cost_usd: None,
            processed_at,
        };

        self.metadata_store
            .update_document_status(
                input.doc_id,
                DocumentStatus::Completed,
                StatusPatch {
                    chunk_count: Some(result.chunk_count as u64),
                    processing_step: Some("finalize".to_string()),
                    processed_at: Some(processed_at),
                    total_tokens: result.total_tokens,
                    usage: Some(usage_entries),
                    ..Default::default()
                },
            )
            .await?;

        info!(doc_id = input.doc_id, chunks = result.chunk_count, "ingestion completed");
        Ok(result)
    }

    async fn set_step(&self, doc_id: &str, step: &str, current: u64, total: u64) -> Result<()> {
        debug!(doc_id, step, current, total, "pipeline phase");
        self.metadata_store
            .update_document_status(
                doc_id,
                DocumentStatus::Processing,
                StatusPatch {
                    processing_step: Some(step.to_string()),
                    progress: Some(ProcessingProgress {
                        current,
                        total,
                        step: step.to_string(),
                    }),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Deletes prior items in the store whose `doc_id` matches and
    /// `version` differs, in batches of 1000 (§4.H step 5).
    async fn delete_stale_chunks(&self, doc_id: &str, version: &str) -> Result<usize> {
        let all = self.store.list().await?;
        let stale_ids: Vec<String> = all
            .into_iter()
            .filter(|item| {
                item.metadata.get("doc_id").and_then(|v| v.as_str()) == Some(doc_id)
                    && item.metadata.get("version").and_then(|v| v.as_str()) != Some(version)
            })
            .map(|item| item.id)
            .collect();

        let mut deleted = 0;
        for batch in stale_ids.chunks(1000) {
            deleted += self.store.delete(batch).await?;
        }
        Ok(deleted)
    }

    /// Merges embedding-cache hits with fresh provider calls for misses,
    /// preserving input order (§5 ordering guarantees). Returns the usage
    /// reported by each fresh provider call (cache hits report none).
    async fn embed_batch(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, Vec<Usage>)> {
        let cached = self.embedding_cache.get_many(texts, &self.config.embedding_model).await;

        let mut results = vec![None; texts.len()];
        let mut misses = Vec::new();
        for (idx, (text, cached_value)) in texts.iter().zip(cached.iter()).enumerate() {
            match cached_value {
                Some(embedding) => results[idx] = Some(embedding.clone()),
                None => misses.push((idx, text.clone())),
            }
        }

        let mut call_usage = Vec::new();
        if !misses.is_empty() {
            let mut fresh = Vec::with_capacity(misses.len());
            for (_, text) in &misses {
                let response = self.provider.embed(&self.config.embedding_model, text).await?;
                if let Some(usage) = response.usage {
                    call_usage.push(usage);
                }
                fresh.push((text.clone(), response.embedding));
            }
            self.embedding_cache.set_many(fresh.clone(), &self.config.embedding_model).await?;
            for ((idx, _), (_, embedding)) in misses.iter().zip(fresh.into_iter()) {
                results[*idx] = Some(embedding);
            }
        }

        let embeddings = results
            .into_iter()
            .enumerate()
            .map(|(idx, v)| v.ok_or_else(|| CoreError::Internal(anyhow::anyhow!("missing embedding for index {idx}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok((embeddings, call_usage))
    }
}

/// Runs the pipeline and reconciles document status for every exit path:
/// `cancelled` for `CoreError::Cancelled`, `error` for anything else that
/// escapes, leaving `completed` (set inside `run`) untouched on success.
pub async fn run_with_status_recovery(
    pipeline: &Pipeline,
    input: PipelineInput<'_>,
    cancel: &CancellationToken,
) -> Result<IngestionResult> {
    let doc_id = input.doc_id.to_string();
    match pipeline.run(input, cancel).await {
        Ok(result) => Ok(result),
        Err(CoreError::Cancelled) => {
            pipeline
                .metadata_store
                .update_document_status(&doc_id, DocumentStatus::Cancelled, StatusPatch::default())
                .await
                .ok();
            Err(CoreError::Cancelled)
        }
        Err(e) => {
            warn!(doc_id, error = %e, "ingestion failed");
            pipeline
                .metadata_store
                .update_document_status(
                    &doc_id,
                    DocumentStatus::Error,
                    StatusPatch {
                        error: Some(e.to_string()),
                        ..Default::default()
                    },
                )
                .await
                .ok();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_default_embedded_text_includes_section_and_chunk_text() {
        let chunk = RawChunk {
            chunk_index: 0,
            text: "hello world".to_string(),
            start_char: 0,
            end_char: 11,
            start_line: 0,
            end_line: 0,
            heading_path: "Intro".to_string(),
            content_type: crate::ingestion::types::ContentType::Markdown,
            language: None,
        };
        let text = build_default_embedded_text("file:///a.md", "doc1", "v1", &chunk);
        assert!(text.contains("Intro"));
        assert!(text.contains("hello world"));
        assert!(text.contains("doc1@v1"));
    }
}
