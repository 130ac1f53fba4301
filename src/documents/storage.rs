//! Versioned document blob store (§4.E): `documents/<docId>/<version>.md`.

use std::path::PathBuf;

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};

/// First 16 hex characters of `sha256(sourceUri + ":" + (contentHash ??
/// timestamp))`.
pub fn create_document_id(source_uri: &str, content_hash: Option<&str>) -> String {
    let suffix = content_hash
        .map(str::to_string)
        .unwrap_or_else(|| Utc::now().timestamp_millis().to_string());
    let mut hasher = Sha256::new();
    hasher.update(source_uri.as_bytes());
    hasher.update(b":");
    hasher.update(suffix.as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

pub struct ReadDocument {
    pub version: String,
    pub content: Vec<u8>,
}

pub struct DocumentStorage {
    root: PathBuf,
}

impl DocumentStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn doc_dir(&self, doc_id: &str) -> PathBuf {
        self.root.join(doc_id)
    }

    pub async fn store_document(&self, doc_id: &str, version: &str, bytes: &[u8]) -> Result<()> {
        let dir = self.doc_dir(doc_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{version}.md"));
        let tmp = path.with_extension("md.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Returns the requested version, or the lexicographically newest
    /// version when `version` is `None` (versions are monotonic decimal
    /// timestamps, so lexicographic order is chronological order).
    pub async fn read_document(&self, doc_id: &str, version: Option<&str>) -> Result<ReadDocument> {
        let dir = self.doc_dir(doc_id);
        match version {
            Some(v) => {
                let path = dir.join(format!("{v}.md"));
                let content = tokio::fs::read(&path)
                    .await
                    .map_err(|_| CoreError::NotFound(format!("document {doc_id}@{v}")))?;
                Ok(ReadDocument {
                    version: v.to_string(),
                    content,
                })
            }
            None => {
                let latest = self.latest_version(doc_id).await?;
                let path = dir.join(format!("{latest}.md"));
                let content = tokio::fs::read(&path)
                    .await
                    .map_err(|_| CoreError::NotFound(format!("document {doc_id}@{latest}")))?;
                Ok(ReadDocument {
                    version: latest,
                    content,
                })
            }
        }
    }

    async fn latest_version(&self, doc_id: &str) -> Result<String> {
        let dir = self.doc_dir(doc_id);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|_| CoreError::NotFound(format!("document {doc_id}")))?;
        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("md") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    versions.push(stem.to_string());
                }
            }
        }
        versions.sort();
        versions
            .pop()
            .ok_or_else(|| CoreError::NotFound(format!("document {doc_id} has no versions")))
    }

    /// Lists every docId that has at least one stored version. `storeId`
    /// filtering is the metadata store's responsibility (4.F); this layer
    /// only knows about blobs.
    pub async fn list_documents(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut doc_ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    doc_ids.push(name.to_string());
                }
            }
        }
        Ok(doc_ids)
    }

    pub async fn delete_document(&self, doc_id: &str) -> Result<()> {
        let dir = self.doc_dir(doc_id);
        match tokio::fs::remove_dir_all(&dir).await {
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

    #[test]
    fn document_id_is_deterministic_for_same_inputs() {
        let a = create_document_id("file:///a.md", Some("hash1"));
        let b = create_document_id("file:///a.md", Some("hash1"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn document_id_differs_by_source_uri() {
        let a = create_document_id("file:///a.md", Some("hash1"));
        let b = create_document_id("file:///b.md", Some("hash1"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn store_then_read_round_trips_bytes() {
        let dir = tempdir().unwrap();
        let storage = DocumentStorage::new(dir.path().to_path_buf());
        storage.store_document("doc1", "1700000000000", b"hello").await.unwrap();
        let read = storage.read_document("doc1", None).await.unwrap();
        assert_eq!(read.content, b"hello");
        assert_eq!(read.version, "1700000000000");
    }

    #[tokio::test]
    async fn read_without_version_returns_latest() {
        let dir = tempdir().unwrap();
        let storage = DocumentStorage::new(dir.path().to_path_buf());
        storage.store_document("doc1", "1700000000000", b"v1").await.unwrap();
        storage.store_document("doc1", "1700000001000", b"v2").await.unwrap();
        let read = storage.read_document("doc1", None).await.unwrap();
        assert_eq!(read.content, b"v2");
        assert_eq!(read.version, "1700000001000");
    }

    #[tokio::test]
    async fn read_missing_document_is_not_found() {
        let dir = tempdir().unwrap();
        let storage = DocumentStorage::new(dir.path().to_path_buf());
        let err = storage.read_document("missing", None).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_document_is_idempotent() {
        let dir = tempdir().unwrap();
        let storage = DocumentStorage::new(dir.path().to_path_buf());
        storage.store_document("doc1", "1", b"x").await.unwrap();
        storage.delete_document("doc1").await.unwrap();
        storage.delete_document("doc1").await.unwrap();
        assert!(storage.list_documents().await.unwrap().is_empty());
    }
}
