//! Processing registry (§4.G): at most one live ingestion job per docId,
//! holding that job's cancellation signal so other callers can cancel or
//! supersede it.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::documents::metadata::{DocumentMetadataStore, DocumentStatus, StatusPatch};
use crate::error::Result;

struct Registration {
    cancel: CancellationToken,
    started_at: Instant,
    /// Signalled by `unregister`; `register` on a live docId awaits this
    /// before installing the new registration.
    done: Arc<Notify>,
}

/// A handle returned by `register`. Dropping it without calling
/// `unregister` still leaves the registry entry in place — callers must
/// explicitly unregister when the job finishes.
pub struct ProcessingHandle {
    pub doc_id: String,
    pub cancel: CancellationToken,
    pub started_at: Instant,
}

#[derive(Default)]
pub struct ProcessingRegistry {
    jobs: DashMap<String, Registration>,
}

impl ProcessingRegistry {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
        }
    }

    /// Registers a new job for `doc_id`. If one is already live, cancels it
    /// and waits for it to unregister before installing the new entry.
    pub async fn register(&self, doc_id: &str) -> ProcessingHandle {
        loop {
            let existing_done = self.jobs.get(doc_id).map(|entry| {
                entry.cancel.cancel();
                entry.done.clone()
            });
            if let Some(done) = existing_done {
                done.notified().await;
                continue;
            }
            break;
        }

        let cancel = CancellationToken::new();
        let started_at = Instant::now();
        let done = Arc::new(Notify::new());
        self.jobs.insert(
            doc_id.to_string(),
            Registration {
                cancel: cancel.clone(),
                started_at,
                done,
            },
        );
        ProcessingHandle {
            doc_id: doc_id.to_string(),
            cancel,
            started_at,
        }
    }

    pub fn is_processing(&self, doc_id: &str) -> bool {
        self.jobs.contains_key(doc_id)
    }

    /// Idempotent: cancelling a docId with no live registration is a no-op.
    pub fn cancel(&self, doc_id: &str) {
        if let Some(entry) = self.jobs.get(doc_id) {
            entry.cancel.cancel();
        }
    }

    pub fn unregister(&self, doc_id: &str) {
        if let Some((_, registration)) = self.jobs.remove(doc_id) {
            registration.done.notify_waiters();
        }
    }
}

/// On process restart, any document metadata left in `processing` or
/// `pending` belongs to a job whose registry entry no longer exists — the
/// registry is in-process and ephemeral. Transition those records to
/// `cancelled` so they don't appear live forever.
pub async fn recover_stale_jobs(metadata_store: &DocumentMetadataStore) -> Result<usize> {
    let all = metadata_store.list_document_metadata(None).await?;
    let mut recovered = 0;
    for doc in all {
        if matches!(doc.status, DocumentStatus::Processing | DocumentStatus::Pending) {
            warn!(doc_id = %doc.doc_id, status = ?doc.status, "recovering stale job on startup");
            metadata_store
                .update_document_status(
                    &doc.doc_id,
                    DocumentStatus::Cancelled,
                    StatusPatch {
                        error: Some("interrupted by restart".to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            recovered += 1;
        }
    }
    if recovered > 0 {
        info!(count = recovered, "recovered stale ingestion jobs");
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[tokio::test]
    async fn register_then_is_processing() {
        let registry = ProcessingRegistry::new();
        let handle = registry.register("doc1").await;
        assert!(registry.is_processing("doc1"));
        assert_eq!(handle.doc_id, "doc1");
    }

    #[tokio::test]
    async fn unregister_clears_processing_state() {
        let registry = ProcessingRegistry::new();
        registry.register("doc1").await;
        registry.unregister("doc1");
        assert!(!registry.is_processing("doc1"));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_for_unknown_doc_id() {
        let registry = ProcessingRegistry::new();
        registry.cancel("missing");
    }

    #[tokio::test]
    async fn register_on_live_doc_id_cancels_previous_and_waits() {
        let registry = Arc::new(ProcessingRegistry::new());
        let first = registry.register("doc1").await;
        assert!(!first.cancel.is_cancelled());

        let registry2 = registry.clone();
        let waiter = tokio::spawn(async move { registry2.register("doc1").await });

        // Give the waiter a chance to observe the cancellation request.
        tokio::task::yield_now().await;
        assert!(first.cancel.is_cancelled());
        registry.unregister("doc1");

        let second = waiter.await.unwrap();
        assert_eq!(second.doc_id, "doc1");
        assert!(registry.is_processing("doc1"));
    }

    fn sample_metadata(
        doc_id: &str,
        status: DocumentStatus,
    ) -> crate::documents::metadata::DocumentMetadata {
        crate::documents::metadata::DocumentMetadata {
            doc_id: doc_id.to_string(),
            store_id: "s".to_string(),
            source_uri: "uri".to_string(),
            version: "1".to_string(),
            status,
            uploaded_at: chrono::Utc::now(),
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
    async fn recovery_pass_cancels_stale_processing_and_pending_docs() {
        let dir = tempdir().unwrap();
        let store = DocumentMetadataStore::new(PathBuf::from(dir.path()));
        store
            .store_document_metadata(&sample_metadata("doc1", DocumentStatus::Processing))
            .await
            .unwrap();
        store
            .store_document_metadata(&sample_metadata("doc2", DocumentStatus::Completed))
            .await
            .unwrap();

        let recovered = recover_stale_jobs(&store).await.unwrap();
        assert_eq!(recovered, 1);

        let doc1 = store.read_document_metadata("doc1").await.unwrap();
        assert_eq!(doc1.status, DocumentStatus::Cancelled);
        let doc2 = store.read_document_metadata("doc2").await.unwrap();
        assert_eq!(doc2.status, DocumentStatus::Completed);
    }
}
