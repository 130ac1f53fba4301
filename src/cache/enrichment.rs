//! Enrichment cache (§4.C): content-addressed `(model, promptVersion,
//! chunk-and-context) -> rendered embeddedText`.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::JsonCache;
use crate::error::Result;

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct EnrichmentCacheEntry {
    pub embedded_text: String,
    pub model: String,
    pub prompt_version: String,
    pub doc_id: Option<String>,
    pub version: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Inputs that make an enrichment result reproducible. Every field
/// contributes to the cache key so that changing any of them (including
/// the enrichment content-flag set — see SPEC_FULL.md §9 open questions)
/// invalidates previously-cached entries rather than silently reusing
/// stale output.
pub struct EnrichmentKeyInput<'a> {
    pub model: &'a str,
    pub prompt_version: &'a str,
    pub doc_id: Option<&'a str>,
    pub version: Option<&'a str>,
    pub heading_path: &'a str,
    pub content_type: &'a str,
    pub language: Option<&'a str>,
    pub raw_chunk: &'a str,
    pub outward_context: &'a str,
    /// Sorted, stable-ordered names of the enrichment content flags enabled
    /// for this render (source/heading_path/author/.../possible_queries).
    pub content_flags: &'a [&'a str],
}

#[derive(Clone)]
pub struct EnrichmentCache {
    inner: JsonCache<EnrichmentCacheEntry>,
}

impl EnrichmentCache {
    pub fn new(path: PathBuf) -> Self {
        Self {
            inner: JsonCache::new(path),
        }
    }

    pub fn key(input: &EnrichmentKeyInput) -> String {
        let mut hasher = Sha256::new();
        hasher.update(input.model.as_bytes());
        hasher.update(b"|");
        hasher.update(input.prompt_version.as_bytes());
        hasher.update(b"|");
        hasher.update(input.doc_id.unwrap_or_default().as_bytes());
        hasher.update(b"|");
        hasher.update(input.version.unwrap_or_default().as_bytes());
        hasher.update(b"|");
        hasher.update(input.heading_path.as_bytes());
        hasher.update(b"|");
        hasher.update(input.content_type.as_bytes());
        hasher.update(b"|");
        hasher.update(input.language.unwrap_or_default().as_bytes());
        hasher.update(b"|");
        hasher.update(input.raw_chunk.as_bytes());
        hasher.update(b"|");
        hasher.update(input.outward_context.as_bytes());
        hasher.update(b"|");
        hasher.update(input.content_flags.join(",").as_bytes());
        let digest = hasher.finalize();
        let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
        format!("{}:{}:{}", input.model, input.prompt_version, hex)
    }

    pub async fn get(&self, input: &EnrichmentKeyInput<'_>) -> Option<String> {
        self.inner.get(&Self::key(input)).await.map(|e| e.embedded_text)
    }

    pub async fn set(&self, input: &EnrichmentKeyInput<'_>, embedded_text: String) -> Result<()> {
        let entry = EnrichmentCacheEntry {
            embedded_text,
            model: input.model.to_string(),
            prompt_version: input.prompt_version.to_string(),
            doc_id: input.doc_id.map(str::to_string),
            version: input.version.map(str::to_string),
            created_at: Utc::now(),
        };
        self.inner.set(Self::key(input), entry).await
    }

    /// Purge every cached enrichment belonging to `doc_id`, part of the
    /// delete cascade in §3 "Lifecycles".
    pub async fn delete_by_doc_id(&self, doc_id: &str) -> Result<usize> {
        self.inner
            .delete_by_filter(|e| e.doc_id.as_deref() == Some(doc_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_input<'a>(raw_chunk: &'a str) -> EnrichmentKeyInput<'a> {
        EnrichmentKeyInput {
            model: "gpt-4o-mini",
            prompt_version: "v1",
            doc_id: Some("abc123"),
            version: Some("1700000000000"),
            heading_path: "Intro",
            content_type: "markdown",
            language: None,
            raw_chunk,
            outward_context: "",
            content_flags: &["summary", "key_points"],
        }
    }

    #[test]
    fn key_is_deterministic() {
        let input = sample_input("hello");
        assert_eq!(EnrichmentCache::key(&input), EnrichmentCache::key(&input));
    }

    #[test]
    fn different_chunks_produce_different_keys() {
        let a = sample_input("hello");
        let b = sample_input("world");
        assert_ne!(EnrichmentCache::key(&a), EnrichmentCache::key(&b));
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let cache = EnrichmentCache::new(dir.path().join("chunkEnrichmentCache.json"));
        let input = sample_input("hello");
        cache.set(&input, "rendered text".into()).await.unwrap();
        assert_eq!(cache.get(&input).await.unwrap(), "rendered text");
    }

    #[tokio::test]
    async fn delete_by_doc_id_removes_only_matching_entries() {
        let dir = tempdir().unwrap();
        let cache = EnrichmentCache::new(dir.path().join("cache.json"));
        let mut a = sample_input("a");
        a.doc_id = Some("doc-a");
        let mut b = sample_input("b");
        b.doc_id = Some("doc-b");
        cache.set(&a, "a-text".into()).await.unwrap();
        cache.set(&b, "b-text".into()).await.unwrap();

        let removed = cache.delete_by_doc_id("doc-a").await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get(&a).await.is_none());
        assert!(cache.get(&b).await.is_some());
    }
}
