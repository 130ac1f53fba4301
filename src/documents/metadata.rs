//! Per-document JSON metadata store (§4.F).

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::atomic_file::write_json_atomic;
use crate::error::{CoreError, Result};
use crate::usage::UsageEntry;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Error,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessingProgress {
    pub current: u64,
    pub total: u64,
    pub step: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: String,
    pub store_id: String,
    pub source_uri: String,
    pub version: String,
    pub status: DocumentStatus,
    pub uploaded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProcessingProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "processedAt", skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(rename = "usage", default, skip_serializing_if = "Vec::is_empty")]
    pub usage: Vec<UsageEntry>,
    #[serde(rename = "totalCost", skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
    #[serde(rename = "totalTokens", skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

/// Fields an `updateDocumentStatus` call may patch alongside the status
/// transition itself.
#[derive(Default)]
pub struct StatusPatch {
    pub processing_step: Option<String>,
    pub progress: Option<ProcessingProgress>,
    pub chunk_count: Option<u64>,
    pub error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub usage: Option<Vec<UsageEntry>>,
    pub total_cost: Option<f64>,
    pub total_tokens: Option<u64>,
}

pub struct DocumentMetadataStore {
    dir: PathBuf,
    // Serializes the read-modify-write cycle so two concurrent
    // `updateDocumentStatus` calls for the same docId can't interleave
    // (§5 shared-resource policy: last-write-wins is acceptable provided
    // the writer re-reads the latest record before mutating).
    write_lock: Mutex<()>,
}

impl DocumentMetadataStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            write_lock: Mutex::new(()),
        }
    }

    fn path(&self, doc_id: &str) -> PathBuf {
        self.dir.join(format!("{doc_id}.json"))
    }

    pub async fn read_document_metadata(&self, doc_id: &str) -> Result<DocumentMetadata> {
        let path = self.path(doc_id);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| CoreError::NotFound(format!("document metadata {doc_id}")))?;
        serde_json::from_str(&content).map_err(|e| e.into())
    }

    pub async fn store_document_metadata(&self, metadata: &DocumentMetadata) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        write_json_atomic(&self.path(&metadata.doc_id), metadata)
    }

    pub async fn update_document_status(
        &self,
        doc_id: &str,
        status: DocumentStatus,
        patch: StatusPatch,
    ) -> Result<DocumentMetadata> {
        let _guard = self.write_lock.lock().await;
        let mut metadata = self.read_document_metadata(doc_id).await?;
        metadata.status = status;
        if let Some(step) = patch.processing_step {
            metadata.processing_step = Some(step);
        }
        if let Some(progress) = patch.progress {
            metadata.progress = Some(progress);
        }
        if let Some(chunk_count) = patch.chunk_count {
            metadata.chunk_count = Some(chunk_count);
        }
        if let Some(error) = patch.error {
            metadata.error = Some(error);
        }
        if let Some(processed_at) = patch.processed_at {
            metadata.processed_at = Some(processed_at);
        }
        if let Some(usage) = patch.usage {
            metadata.usage = usage;
        }
        if let Some(total_cost) = patch.total_cost {
            metadata.total_cost = Some(total_cost);
        }
        if let Some(total_tokens) = patch.total_tokens {
            metadata.total_tokens = Some(total_tokens);
        }
        self.store_document_metadata(&metadata).await?;
        Ok(metadata)
    }

    pub async fn list_document_metadata(&self, store_id: Option<&str>) -> Result<Vec<DocumentMetadata>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut all = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<DocumentMetadata>(&content) {
                Ok(metadata) => all.push(metadata),
                Err(_) => continue,
            }
        }
        if let Some(store_id) = store_id {
            all.retain(|m| m.store_id == store_id);
        }
        all.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(all)
    }

    pub async fn find_doc_id_by_source_uri(&self, uri: &str, store_id: Option<&str>) -> Result<Option<String>> {
        let all = self.list_document_metadata(store_id).await?;
        Ok(all.into_iter().find(|m| m.source_uri == uri).map(|m| m.doc_id))
    }

    pub async fn delete_document_metadata(&self, doc_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(doc_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(doc_id: &str, store_id: &str, source_uri: &str) -> DocumentMetadata {
        DocumentMetadata {
            doc_id: doc_id.to_string(),
            store_id: store_id.to_string(),
            source_uri: source_uri.to_string(),
            version: "1700000000000".to_string(),
            status: DocumentStatus::Pending,
            uploaded_at: Utc::now(),
            author: None,
            description: None,
            tags: Vec::new(),
            processing_step: None,
            progress: None,
            chunk_count: None,
            error: None,
            processed_at: None,
            usage: Vec::new(),
            total_cost: None,
            total_tokens: None,
        }
    }

    #[tokio::test]
    async fn store_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = DocumentMetadataStore::new(dir.path().to_path_buf());
        let metadata = sample("doc1", "store1", "file:///a.md");
        store.store_document_metadata(&metadata).await.unwrap();
        let read = store.read_document_metadata("doc1").await.unwrap();
        assert_eq!(read.source_uri, "file:///a.md");
    }

    #[tokio::test]
    async fn update_document_status_patches_and_persists() {
        let dir = tempdir().unwrap();
        let store = DocumentMetadataStore::new(dir.path().to_path_buf());
        store.store_document_metadata(&sample("doc1", "store1", "uri")).await.unwrap();

        let updated = store
            .update_document_status(
                "doc1",
                DocumentStatus::Completed,
                StatusPatch {
                    chunk_count: Some(6),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, DocumentStatus::Completed);
        assert_eq!(updated.chunk_count, Some(6));

        let reread = store.read_document_metadata("doc1").await.unwrap();
        assert_eq!(reread.status, DocumentStatus::Completed);
    }

    #[tokio::test]
    async fn list_sorts_by_uploaded_at_descending() {
        let dir = tempdir().unwrap();
        let store = DocumentMetadataStore::new(dir.path().to_path_buf());
        let mut older = sample("doc1", "s", "uri1");
        older.uploaded_at = Utc::now() - chrono::Duration::seconds(10);
        let newer = sample("doc2", "s", "uri2");
        store.store_document_metadata(&older).await.unwrap();
        store.store_document_metadata(&newer).await.unwrap();

        let listed = store.list_document_metadata(None).await.unwrap();
        assert_eq!(listed[0].doc_id, "doc2");
        assert_eq!(listed[1].doc_id, "doc1");
    }

    #[tokio::test]
    async fn find_doc_id_by_source_uri_returns_most_recent_match() {
        let dir = tempdir().unwrap();
        let store = DocumentMetadataStore::new(dir.path().to_path_buf());
        let mut older = sample("doc1", "s", "same-uri");
        older.uploaded_at = Utc::now() - chrono::Duration::seconds(10);
        let newer = sample("doc2", "s", "same-uri");
        store.store_document_metadata(&older).await.unwrap();
        store.store_document_metadata(&newer).await.unwrap();

        let found = store.find_doc_id_by_source_uri("same-uri", None).await.unwrap();
        assert_eq!(found, Some("doc2".to_string()));
    }

    #[tokio::test]
    async fn list_filters_by_store_id() {
        let dir = tempdir().unwrap();
        let store = DocumentMetadataStore::new(dir.path().to_path_buf());
        store.store_document_metadata(&sample("doc1", "store-a", "u1")).await.unwrap();
        store.store_document_metadata(&sample("doc2", "store-b", "u2")).await.unwrap();

        let listed = store.list_document_metadata(Some("store-a")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].doc_id, "doc1");
    }
}
