//! Embedding cache (§4.B): content-addressed `(model, text) -> vector`.
//!
//! Two instances of this same cache exist on disk: `vectorStoreCache.json`
//! for ingestion-time chunk embeddings and `queryCache.json` for query-time
//! embeddings (§6 on-disk layout) — both are just [`EmbeddingCache`]
//! pointed at different paths.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::JsonCache;
use crate::error::Result;

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct EmbeddingCacheEntry {
    pub text: String,
    pub model: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EmbeddingCache {
    inner: JsonCache<EmbeddingCacheEntry>,
}

impl EmbeddingCache {
    pub fn new(path: PathBuf) -> Self {
        Self {
            inner: JsonCache::new(path),
        }
    }

    fn key(model: &str, text: &str) -> String {
        format!("{model}:{}", text.trim())
    }

    pub async fn get(&self, text: &str, model: &str) -> Option<Vec<f32>> {
        self.inner
            .get(&Self::key(model, text))
            .await
            .map(|e| e.embedding)
    }

    pub async fn get_many(&self, texts: &[String], model: &str) -> Vec<Option<Vec<f32>>> {
        let keys: Vec<String> = texts.iter().map(|t| Self::key(model, t)).collect();
        let found = self.inner.get_many(&keys).await;
        keys.iter()
            .map(|k| found.get(k).map(|e| e.embedding.clone()))
            .collect()
    }

    pub async fn set(&self, text: &str, embedding: Vec<f32>, model: &str) -> Result<()> {
        let entry = EmbeddingCacheEntry {
            text: text.trim().to_string(),
            model: model.to_string(),
            embedding,
            created_at: Utc::now(),
        };
        self.inner.set(Self::key(model, text), entry).await
    }

    pub async fn set_many(&self, items: Vec<(String, Vec<f32>)>, model: &str) -> Result<()> {
        let entries = items
            .into_iter()
            .map(|(text, embedding)| {
                let key = Self::key(model, &text);
                (
                    key,
                    EmbeddingCacheEntry {
                        text: text.trim().to_string(),
                        model: model.to_string(),
                        embedding,
                        created_at: Utc::now(),
                    },
                )
            })
            .collect();
        self.inner.set_many(entries).await
    }

    /// Purge entries referencing a document, used by the delete cascade in
    /// §3 "Lifecycles". The embedding cache is keyed by text, not docId, so
    /// callers pass a predicate over the cached text (e.g. entries built
    /// from a known `embeddedText` template for that doc/version).
    pub async fn delete_by_filter<F>(&self, predicate: F) -> Result<usize>
    where
        F: Fn(&EmbeddingCacheEntry) -> bool,
    {
        self.inner.delete_by_filter(predicate).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn set_then_get_returns_same_vector() {
        let dir = tempdir().unwrap();
        let cache = EmbeddingCache::new(dir.path().join("vectorStoreCache.json"));
        cache
            .set("hello world", vec![0.1, 0.2, 0.3], "text-embedding-3")
            .await
            .unwrap();
        let got = cache.get("hello world", "text-embedding-3").await.unwrap();
        assert_eq!(got, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn key_trims_text_but_distinguishes_models() {
        let dir = tempdir().unwrap();
        let cache = EmbeddingCache::new(dir.path().join("cache.json"));
        cache
            .set("  padded  ", vec![1.0], "model-a")
            .await
            .unwrap();
        assert!(cache.get("padded", "model-a").await.is_some());
        assert!(cache.get("padded", "model-b").await.is_none());
    }

    #[tokio::test]
    async fn get_many_preserves_order_with_misses() {
        let dir = tempdir().unwrap();
        let cache = EmbeddingCache::new(dir.path().join("cache.json"));
        cache.set("a", vec![1.0], "m").await.unwrap();
        cache.set("c", vec![3.0], "m").await.unwrap();
        let got = cache
            .get_many(&["a".into(), "b".into(), "c".into()], "m")
            .await;
        assert_eq!(got.len(), 3);
        assert!(got[0].is_some());
        assert!(got[1].is_none());
        assert!(got[2].is_some());
    }
}
