//! External local-index-style vector store backend (§4.D open question):
//! a directory per store (`<storeId>.vectra/`) with one JSON file per item
//! plus a `zoeflow.meta.json` sidecar, instead of the single-file JSON
//! backend's layout. Query/upsert semantics are identical — linear-scan
//! cosine similarity over an in-memory snapshot reloaded from disk — so
//! this exists purely to match the directory-per-item shape a
//! Vectra-compatible index expects on disk, without adding an ANN crate
//! the donor stack never carried.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::atomic_file::write_json_atomic;
use crate::error::{Result, StoreError};
use crate::vecmath::cosine_similarity;

use super::{
    QueryResult, StoreInfo, UpsertItem, UpsertSummary, VectorStoreBackend, VectorStoreItem,
    validate_upsert_item,
};

const META_VERSION: &str = "v1";
const META_FILE: &str = "zoeflow.meta.json";

#[derive(Serialize, Deserialize)]
struct IndexMeta {
    version: String,
    dimension: Option<usize>,
}

impl Default for IndexMeta {
    fn default() -> Self {
        Self {
            version: META_VERSION.to_string(),
            dimension: None,
        }
    }
}

/// On-disk shape of a single item file: `metadataJson` plus promoted
/// first-class fields so a reader can filter/sort without parsing it.
#[derive(Serialize, Deserialize, Clone)]
struct ItemRecord {
    id: String,
    text: String,
    vector: Vec<f32>,
    #[serde(rename = "createdAt")]
    created_at: i64,
    #[serde(rename = "updatedAt")]
    updated_at: i64,
    #[serde(rename = "docId", skip_serializing_if = "Option::is_none")]
    doc_id: Option<String>,
    #[serde(rename = "chunkIndex", skip_serializing_if = "Option::is_none")]
    chunk_index: Option<i64>,
    #[serde(rename = "sourceUri", skip_serializing_if = "Option::is_none")]
    source_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(rename = "metadataJson")]
    metadata_json: String,
}

fn promote(metadata: &HashMap<String, Value>, field: &str) -> Option<String> {
    metadata.get(field).and_then(|v| v.as_str()).map(str::to_string)
}

fn promote_i64(metadata: &HashMap<String, Value>, field: &str) -> Option<i64> {
    metadata.get(field).and_then(|v| v.as_i64())
}

fn record_from_item(item: &VectorStoreItem) -> ItemRecord {
    ItemRecord {
        id: item.id.clone(),
        text: item.text.clone(),
        vector: item.embedding.clone(),
        created_at: item.created_at,
        updated_at: item.updated_at,
        doc_id: promote(&item.metadata, "doc_id"),
        chunk_index: promote_i64(&item.metadata, "chunk_index"),
        source_uri: promote(&item.metadata, "source_uri"),
        version: promote(&item.metadata, "version"),
        metadata_json: serde_json::to_string(&item.metadata).unwrap_or_default(),
    }
}

/// Reconstruct full metadata from a record, falling back to parsing a
/// legacy `chunk_<docId>_<chunkIndex>_*` id when the promoted fields and
/// `metadataJson` are both empty (pre-existing index migrated onto this
/// backend).
fn metadata_from_record(record: &ItemRecord) -> HashMap<String, Value> {
    let mut metadata: HashMap<String, Value> = serde_json::from_str(&record.metadata_json).unwrap_or_default();

    if let Some(doc_id) = &record.doc_id {
        metadata.entry("doc_id".to_string()).or_insert_with(|| Value::String(doc_id.clone()));
    }
    if let Some(chunk_index) = record.chunk_index {
        metadata.entry("chunk_index".to_string()).or_insert_with(|| Value::from(chunk_index));
    }
    if let Some(source_uri) = &record.source_uri {
        metadata.entry("source_uri".to_string()).or_insert_with(|| Value::String(source_uri.clone()));
    }
    if let Some(version) = &record.version {
        metadata.entry("version".to_string()).or_insert_with(|| Value::String(version.clone()));
    }

    if !metadata.contains_key("doc_id") {
        if let Some((doc_id, chunk_index)) = parse_legacy_id(&record.id) {
            metadata.insert("doc_id".to_string(), Value::String(doc_id));
            metadata.insert("chunk_index".to_string(), Value::from(chunk_index));
        }
    }

    metadata
}

fn parse_legacy_id(id: &str) -> Option<(String, i64)> {
    let rest = id.strip_prefix("chunk_")?;
    let mut parts = rest.splitn(3, '_');
    let doc_id = parts.next()?.to_string();
    let chunk_index: i64 = parts.next()?.parse().ok()?;
    Some((doc_id, chunk_index))
}

fn record_to_item(record: ItemRecord) -> VectorStoreItem {
    let metadata = metadata_from_record(&record);
    VectorStoreItem {
        id: record.id,
        text: record.text,
        embedding_norm: crate::vecmath::l2_norm(&record.vector),
        embedding: record.vector,
        metadata,
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}

fn item_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.json"))
}

pub struct LocalIndexVectorStore {
    dir: PathBuf,
    meta: Arc<Mutex<Option<IndexMeta>>>,
}

impl LocalIndexVectorStore {
    /// `dir` is the `<storeId>.vectra/` directory, not the store id itself.
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            meta: Arc::new(Mutex::new(None)),
        }
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    async fn load_meta<'a>(&self, guard: &mut tokio::sync::MutexGuard<'a, Option<IndexMeta>>) -> Result<()> {
        if guard.is_some() {
            return Ok(());
        }
        let path = self.meta_path();
        if !path.exists() {
            **guard = Some(IndexMeta::default());
            return Ok(());
        }
        let content = tokio::fs::read_to_string(&path).await?;
        let meta: IndexMeta = serde_json::from_str(&content)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
        **guard = Some(meta);
        Ok(())
    }

    fn persist_meta(&self, meta: &IndexMeta) -> Result<()> {
        write_json_atomic(&self.meta_path(), meta)
    }

    async fn read_all_records(&self) -> Result<Vec<ItemRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some(META_FILE) {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            let record: ItemRecord = serde_json::from_str(&content)
                .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
            records.push(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl VectorStoreBackend for LocalIndexVectorStore {
    async fn load(&self) -> Result<StoreInfo> {
        let mut guard = self.meta.lock().await;
        self.load_meta(&mut guard).await?;
        Ok(StoreInfo {
            dimension: guard.as_ref().unwrap().dimension,
        })
    }

    async fn upsert(&self, items: Vec<UpsertItem>) -> Result<UpsertSummary> {
        for item in &items {
            validate_upsert_item(item)?;
        }

        tokio::fs::create_dir_all(&self.dir).await?;

        let mut guard = self.meta.lock().await;
        self.load_meta(&mut guard).await?;
        let meta = guard.as_mut().unwrap();

        let mut summary = UpsertSummary::default();
        for item in items {
            let dim = item.embedding.len();
            match meta.dimension {
                None => meta.dimension = Some(dim),
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
            let path = item_path(&self.dir, &id);
            let now = Utc::now().timestamp_millis();

            let created_at = if path.exists() {
                let existing = tokio::fs::read_to_string(&path).await?;
                serde_json::from_str::<ItemRecord>(&existing)
                    .map(|r| r.created_at)
                    .unwrap_or(now)
            } else {
                now
            };
            if path.exists() {
                summary.updated += 1;
            } else {
                summary.inserted += 1;
            }
            summary.count += 1;

            let store_item = VectorStoreItem {
                id,
                text: item.text,
                embedding_norm: crate::vecmath::l2_norm(&item.embedding),
                embedding: item.embedding,
                metadata: item.metadata,
                created_at,
                updated_at: now,
            };
            let record = record_from_item(&store_item);
            write_json_atomic(&path, &record)?;
        }

        self.persist_meta(meta)?;
        Ok(summary)
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<QueryResult>> {
        let records = self.read_all_records().await?;
        let mut scored: Vec<(usize, f32)> = records
            .iter()
            .enumerate()
            .map(|(idx, record)| (idx, cosine_similarity(vector, &record.vector)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(idx, score)| {
                let record = records[idx].clone();
                let metadata = metadata_from_record(&record);
                QueryResult {
                    id: record.id,
                    text: record.text,
                    metadata,
                    score,
                }
            })
            .collect())
    }

    async fn delete(&self, ids: &[String]) -> Result<usize> {
        let mut removed = 0;
        for id in ids {
            let path = item_path(&self.dir, id);
            if tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<VectorStoreItem>> {
        let records = self.read_all_records().await?;
        Ok(records.into_iter().map(record_to_item).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn item(id: &str, embedding: Vec<f32>) -> UpsertItem {
        let mut metadata = HashMap::new();
        metadata.insert("doc_id".to_string(), json!("doc-1"));
        UpsertItem {
            id: Some(id.to_string()),
            text: id.to_string(),
            embedding,
            metadata,
        }
    }

    #[tokio::test]
    async fn upsert_creates_one_file_per_item_plus_meta() {
        let dir = tempdir().unwrap();
        let store_dir = dir.path().join("demo.vectra");
        let store = LocalIndexVectorStore::new(store_dir.clone());
        store.upsert(vec![item("a", vec![1.0, 0.0])]).await.unwrap();

        assert!(store_dir.join("a.json").exists());
        assert!(store_dir.join(META_FILE).exists());
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let store = LocalIndexVectorStore::new(dir.path().join("demo.vectra"));
        store.upsert(vec![item("a", vec![1.0, 0.0, 0.0])]).await.unwrap();
        let err = store.upsert(vec![item("b", vec![1.0])]).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::CoreError::Store(StoreError::DimensionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn legacy_id_without_metadata_derives_doc_id() {
        let dir = tempdir().unwrap();
        let store_dir = dir.path().join("demo.vectra");
        let store = LocalIndexVectorStore::new(store_dir);
        store
            .upsert(vec![UpsertItem {
                id: Some("chunk_docabc_3_xyz".into()),
                text: "legacy".into(),
                embedding: vec![0.5, 0.5],
                metadata: HashMap::new(),
            }])
            .await
            .unwrap();

        let items = store.list().await.unwrap();
        assert_eq!(items[0].metadata.get("doc_id"), Some(&json!("docabc")));
        assert_eq!(items[0].metadata.get("chunk_index"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn delete_removes_item_file() {
        let dir = tempdir().unwrap();
        let store_dir = dir.path().join("demo.vectra");
        let store = LocalIndexVectorStore::new(store_dir.clone());
        store.upsert(vec![item("a", vec![1.0])]).await.unwrap();
        let removed = store.delete(&["a".to_string()]).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!store_dir.join("a.json").exists());
    }

    #[tokio::test]
    async fn query_scans_all_item_files() {
        let dir = tempdir().unwrap();
        let store = LocalIndexVectorStore::new(dir.path().join("demo.vectra"));
        store
            .upsert(vec![item("close", vec![1.0, 0.0]), item("far", vec![0.0, 1.0])])
            .await
            .unwrap();

        let results = store.query(&[1.0, 0.1], 1).await.unwrap();
        assert_eq!(results[0].id, "close");
    }
}
