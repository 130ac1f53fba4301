//! Content-addressed, crash-safe file caches (§4.B embedding cache, §4.C
//! enrichment cache). Both share the same on-disk shape — a single JSON
//! file of `{ entries: { key -> entry } }` — and the same durability and
//! concurrency guarantees, so the shared machinery lives here and the two
//! public caches in [`embedding`] and [`enrichment`] only add key
//! derivation and entry shape.

pub mod embedding;
pub mod enrichment;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::atomic_file::write_json_atomic;
use crate::error::Result;

#[derive(Serialize, Deserialize, Default)]
struct CacheFile<E> {
    entries: HashMap<String, E>,
}

/// A single on-disk JSON cache file, lazily loaded and invalidated on every
/// write. Concurrent writers serialize on the internal mutex so no entry
/// written by one caller is lost to another's write-temp-then-rename.
pub struct JsonCache<E> {
    path: PathBuf,
    entries: Arc<Mutex<Option<HashMap<String, E>>>>,
}

impl<E> Clone for JsonCache<E> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            entries: self.entries.clone(),
        }
    }
}

impl<E> JsonCache<E>
where
    E: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            entries: Arc::new(Mutex::new(None)),
        }
    }

    /// Load the file into memory if not already loaded. A corrupt or
    /// missing file is treated as empty (§7 Corrupt: "treat as empty on
    /// load for caches").
    async fn ensure_loaded<'a>(
        &self,
        guard: &mut tokio::sync::MutexGuard<'a, Option<HashMap<String, E>>>,
    ) {
        if guard.is_some() {
            return;
        }
        let loaded = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => match serde_json::from_str::<CacheFile<E>>(&content) {
                Ok(file) => file.entries,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "cache file corrupt, treating as empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        **guard = Some(loaded);
    }

    pub async fn get(&self, key: &str) -> Option<E> {
        let mut guard = self.entries.lock().await;
        self.ensure_loaded(&mut guard).await;
        guard.as_ref().and_then(|m| m.get(key).cloned())
    }

    pub async fn get_many(&self, keys: &[String]) -> HashMap<String, E> {
        let mut guard = self.entries.lock().await;
        self.ensure_loaded(&mut guard).await;
        let map = guard.as_ref().unwrap();
        keys.iter()
            .filter_map(|k| map.get(k).cloned().map(|v| (k.clone(), v)))
            .collect()
    }

    pub async fn set(&self, key: String, entry: E) -> Result<()> {
        self.set_many(vec![(key, entry)]).await
    }

    pub async fn set_many(&self, items: Vec<(String, E)>) -> Result<()> {
        let mut guard = self.entries.lock().await;
        self.ensure_loaded(&mut guard).await;
        let map = guard.as_mut().unwrap();
        for (key, entry) in items {
            map.insert(key, entry);
        }
        self.persist(map)
    }

    /// Delete every entry for which `predicate` returns true. Used for
    /// document-scoped purges (cache entries referencing a deleted docId).
    pub async fn delete_by_filter<F>(&self, predicate: F) -> Result<usize>
    where
        F: Fn(&E) -> bool,
    {
        let mut guard = self.entries.lock().await;
        self.ensure_loaded(&mut guard).await;
        let map = guard.as_mut().unwrap();
        let before = map.len();
        map.retain(|_, v| !predicate(v));
        let removed = before - map.len();
        if removed > 0 {
            self.persist(map)?;
        }
        Ok(removed)
    }

    fn persist(&self, map: &HashMap<String, E>) -> Result<()> {
        let file = CacheFile {
            entries: map.clone(),
        };
        write_json_atomic(&self.path, &file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
    struct Entry {
        value: String,
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let cache: JsonCache<Entry> = JsonCache::new(dir.path().join("cache.json"));
        cache
            .set(
                "k1".into(),
                Entry {
                    value: "v1".into(),
                },
            )
            .await
            .unwrap();
        let got = cache.get("k1").await.unwrap();
        assert_eq!(got.value, "v1");
    }

    #[tokio::test]
    async fn missing_file_is_treated_as_empty() {
        let dir = tempdir().unwrap();
        let cache: JsonCache<Entry> = JsonCache::new(dir.path().join("missing.json"));
        assert!(cache.get("anything").await.is_none());
    }

    #[tokio::test]
    async fn delete_by_filter_removes_matching_entries_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache: JsonCache<Entry> = JsonCache::new(path.clone());
        cache
            .set_many(vec![
                ("a".into(), Entry { value: "doc1".into() }),
                ("b".into(), Entry { value: "doc2".into() }),
            ])
            .await
            .unwrap();
        let removed = cache.delete_by_filter(|e| e.value == "doc1").await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_some());

        // Reload from disk into a fresh cache to confirm the delete persisted.
        let reloaded: JsonCache<Entry> = JsonCache::new(path);
        assert!(reloaded.get("a").await.is_none());
    }
}
