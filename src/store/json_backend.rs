//! Self-contained JSON vector store backend (§4.D): one file per store,
//! `{version:"v1", dimension, items[]}`, queried by linear-scan cosine
//! similarity.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::atomic_file::write_json_atomic;
use crate::error::{Result, StoreError};
use crate::vecmath::cosine_similarity;

use super::{
    QueryResult, StoreInfo, UpsertItem, UpsertSummary, VectorStoreBackend, VectorStoreItem,
    validate_upsert_item,
};

const STORE_VERSION: &str = "v1";

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: String,
    dimension: Option<usize>,
    items: Vec<VectorStoreItem>,
}

impl Default for StoreFile {
    fn default() -> Self {
        Self {
            version: STORE_VERSION.to_string(),
            dimension: None,
            items: Vec::new(),
        }
    }
}

pub struct JsonVectorStore {
    path: PathBuf,
    state: Arc<Mutex<Option<StoreFile>>>,
}

impl JsonVectorStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Arc::new(Mutex::new(None)),
        }
    }

    async fn load_into<'a>(&self, guard: &mut tokio::sync::MutexGuard<'a, Option<StoreFile>>) -> Result<()> {
        if guard.is_some() {
            return Ok(());
        }
        if !self.path.exists() {
            **guard = Some(StoreFile::default());
            return Ok(());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        let file: StoreFile = serde_json::from_str(&content)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", self.path.display())))?;
        if file.version != STORE_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported store version '{}'",
                file.version
            ))
            .into());
        }
        **guard = Some(file);
        Ok(())
    }

    fn persist(&self, file: &StoreFile) -> Result<()> {
        write_json_atomic(&self.path, file)
    }
}

#[async_trait]
impl VectorStoreBackend for JsonVectorStore {
    async fn load(&self) -> Result<StoreInfo> {
        let mut guard = self.state.lock().await;
        self.load_into(&mut guard).await?;
        Ok(StoreInfo {
            dimension: guard.as_ref().unwrap().dimension,
        })
    }

    async fn upsert(&self, items: Vec<UpsertItem>) -> Result<UpsertSummary> {
        for item in &items {
            validate_upsert_item(item)?;
        }

        let mut guard = self.state.lock().await;
        self.load_into(&mut guard).await?;
        let file = guard.as_mut().unwrap();

        let mut summary = UpsertSummary::default();
        for item in items {
            let dim = item.embedding.len();
            match file.dimension {
                None => file.dimension = Some(dim),
                Some(expected) if expected != dim => {
                    return Err(StoreError::DimensionMismatch {
                        expected,
                        actual: dim,
                    }
                    .into());
                }
                _ => {}
            }

            let id = item.id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let now = Utc::now().timestamp_millis();
            if let Some(existing) = file.items.iter_mut().find(|i| i.id == id) {
                existing.text = item.text;
                existing.embedding = item.embedding;
                existing.embedding_norm = crate::vecmath::l2_norm(&existing.embedding);
                existing.metadata = item.metadata;
                existing.updated_at = now;
                summary.updated += 1;
            } else {
                let new_item = VectorStoreItem::new(id, item.text, item.embedding, item.metadata);
                file.items.push(new_item);
                summary.inserted += 1;
            }
            summary.count += 1;
        }

        self.persist(file)?;
        Ok(summary)
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<QueryResult>> {
        let mut guard = self.state.lock().await;
        self.load_into(&mut guard).await?;
        let file = guard.as_ref().unwrap();

        let mut scored: Vec<(usize, f32)> = file
            .items
            .iter()
            .enumerate()
            .map(|(idx, item)| (idx, cosine_similarity(vector, &item.embedding)))
            .collect();
        // Descending by score; ties keep insertion order via a stable sort
        // over the original index.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(idx, score)| {
                let item = &file.items[idx];
                QueryResult {
                    id: item.id.clone(),
                    text: item.text.clone(),
                    metadata: item.metadata.clone(),
                    score,
                }
            })
            .collect())
    }

    async fn delete(&self, ids: &[String]) -> Result<usize> {
        let mut guard = self.state.lock().await;
        self.load_into(&mut guard).await?;
        let file = guard.as_mut().unwrap();

        let id_set: HashMap<&String, ()> = ids.iter().map(|id| (id, ())).collect();
        let before = file.items.len();
        file.items.retain(|item| !id_set.contains_key(&item.id));
        let removed = before - file.items.len();
        if removed > 0 {
            self.persist(file)?;
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<VectorStoreItem>> {
        let mut guard = self.state.lock().await;
        self.load_into(&mut guard).await?;
        Ok(guard.as_ref().unwrap().items.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn item(id: &str, text: &str, embedding: Vec<f32>) -> UpsertItem {
        UpsertItem {
            id: Some(id.to_string()),
            text: text.to_string(),
            embedding,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn dimension_lock_rejects_mismatched_inserts() {
        let dir = tempdir().unwrap();
        let store = JsonVectorStore::new(dir.path().join("demo.json"));

        let summary = store
            .upsert(vec![item("a", "a", vec![0.1, 0.2, 0.3])])
            .await
            .unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.updated, 0);

        let err = store
            .upsert(vec![item("b", "b", vec![0.1, 0.2])])
            .await
            .unwrap_err();
        match err {
            crate::error::CoreError::Store(StoreError::DimensionMismatch { expected, actual }) => {
                assert_eq!(expected, 3);
                assert_eq!(actual, 2);
            }
            other => panic!("expected DimensionMismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn upsert_then_list_round_trips_metadata() {
        let dir = tempdir().unwrap();
        let store = JsonVectorStore::new(dir.path().join("demo.json"));
        let mut metadata = HashMap::new();
        metadata.insert("doc_id".to_string(), json!("doc-1"));
        store
            .upsert(vec![UpsertItem {
                id: Some("x".into()),
                text: "hello".into(),
                embedding: vec![1.0, 0.0],
                metadata: metadata.clone(),
            }])
            .await
            .unwrap();

        let items = store.list().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].text, "hello");
        assert_eq!(items[0].metadata, metadata);
    }

    #[tokio::test]
    async fn query_orders_by_score_descending() {
        let dir = tempdir().unwrap();
        let store = JsonVectorStore::new(dir.path().join("demo.json"));
        store
            .upsert(vec![
                item("close", "close", vec![1.0, 0.0]),
                item("far", "far", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let results = store.query(&[1.0, 0.1], 2).await.unwrap();
        assert_eq!(results[0].id, "close");
        assert_eq!(results[1].id, "far");
    }

    #[tokio::test]
    async fn delete_is_idempotent_for_unknown_ids() {
        let dir = tempdir().unwrap();
        let store = JsonVectorStore::new(dir.path().join("demo.json"));
        let removed = store.delete(&["missing".to_string()]).await.unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn corrupt_file_surfaces_as_store_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("demo.json");
        std::fs::write(&path, b"not json").unwrap();
        let store = JsonVectorStore::new(path);
        let err = store.load().await.unwrap_err();
        assert!(matches!(err, crate::error::CoreError::Store(StoreError::Corrupt(_))));
    }
}
