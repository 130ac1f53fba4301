//! Vector store engine (§4.D): upsert/delete/list/query/queryMany over a
//! named store, behind a pluggable backend (self-contained JSON file vs.
//! an external local-index directory layout).

pub mod json_backend;
pub mod local_index_backend;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result, StoreError};

/// `storeId` must match this pattern (§3).
pub fn is_valid_store_id(store_id: &str) -> bool {
    !store_id.is_empty()
        && store_id.len() <= 64
        && store_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct VectorStoreItem {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub embedding_norm: f32,
    pub metadata: HashMap<String, Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl VectorStoreItem {
    pub fn new(id: String, text: String, embedding: Vec<f32>, metadata: HashMap<String, Value>) -> Self {
        let embedding_norm = crate::vecmath::l2_norm(&embedding);
        let now = Utc::now().timestamp_millis();
        Self {
            id,
            text,
            embedding,
            embedding_norm,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An item as supplied by a caller to `upsert`; `id` is generated when
/// absent.
pub struct UpsertItem {
    pub id: Option<String>,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Default)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
    pub count: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct QueryResult {
    pub id: String,
    pub text: String,
    pub metadata: HashMap<String, Value>,
    pub score: f32,
}

#[derive(Debug, Default)]
pub struct StoreInfo {
    pub dimension: Option<usize>,
}

/// A single vector store backend. Implementations must be crash-safe
/// (write-temp + rename) and enforce the single-dimension-per-store
/// invariant on `upsert`.
#[async_trait]
pub trait VectorStoreBackend: Send + Sync {
    async fn load(&self) -> Result<StoreInfo>;
    async fn upsert(&self, items: Vec<UpsertItem>) -> Result<UpsertSummary>;
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<QueryResult>>;
    async fn delete(&self, ids: &[String]) -> Result<usize>;
    async fn list(&self) -> Result<Vec<VectorStoreItem>>;

    /// Default `queryMany`: run `query` once per input vector. Backends may
    /// override for a batched implementation.
    async fn query_many(&self, vectors: &[Vec<f32>], top_k: usize) -> Result<Vec<Vec<QueryResult>>> {
        let mut out = Vec::with_capacity(vectors.len());
        for v in vectors {
            out.push(self.query(v, top_k).await?);
        }
        Ok(out)
    }
}

pub fn validate_store_id(store_id: &str) -> Result<()> {
    if is_valid_store_id(store_id) {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "invalid storeId '{store_id}': must match ^[A-Za-z0-9_-]{{1,64}}$"
        )))
    }
}

pub fn validate_upsert_item(item: &UpsertItem) -> Result<()> {
    if item.text.is_empty() {
        return Err(StoreError::Invalid("text must not be empty".into()).into());
    }
    if item.embedding.is_empty() {
        return Err(StoreError::Invalid("embedding must not be empty".into()).into());
    }
    Ok(())
}

/// Reciprocal-rank fusion across the per-query result lists returned by
/// `queryMany` (§6 `queryMany`, §9 open question: default `k=60`).
pub fn reciprocal_rank_fusion(per_query_results: &[Vec<QueryResult>], k: u32) -> Vec<QueryResult> {
    let mut scores: HashMap<String, f32> = HashMap::new();
    let mut items: HashMap<String, QueryResult> = HashMap::new();

    for results in per_query_results {
        for (rank, result) in results.iter().enumerate() {
            let contribution = 1.0 / (k as f32 + rank as f32 + 1.0);
            *scores.entry(result.id.clone()).or_insert(0.0) += contribution;
            items.entry(result.id.clone()).or_insert_with(|| result.clone());
        }
    }

    let mut fused: Vec<QueryResult> = items
        .into_iter()
        .map(|(id, mut item)| {
            item.score = scores[&id];
            item
        })
        .collect();

    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_id_validation() {
        assert!(is_valid_store_id("demo"));
        assert!(is_valid_store_id("my-store_1"));
        assert!(!is_valid_store_id(""));
        assert!(!is_valid_store_id("has space"));
        assert!(!is_valid_store_id(&"a".repeat(65)));
    }

    fn result(id: &str, score: f32) -> QueryResult {
        QueryResult {
            id: id.to_string(),
            text: String::new(),
            metadata: HashMap::new(),
            score,
        }
    }

    #[test]
    fn rrf_favors_items_ranked_highly_across_queries() {
        let q1 = vec![result("a", 0.9), result("b", 0.5)];
        let q2 = vec![result("b", 0.95), result("a", 0.1)];
        let fused = reciprocal_rank_fusion(&[q1, q2], 60);
        // "a" and "b" are each rank 0 once and rank 1 once: scores tie.
        assert_eq!(fused.len(), 2);
        assert!((fused[0].score - fused[1].score).abs() < 1e-9);
    }
}
