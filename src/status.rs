//! Status stream (§4.K): a fan-out of document metadata changes. Subscribers
//! address either a set of docIds or a storeId; joiners get a full snapshot
//! before live updates, matching the donor workflow engine's event-bus shape.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::documents::metadata::{DocumentMetadata, DocumentMetadataStore, ProcessingProgress};
use crate::error::{CoreError, Result};
use crate::registry::ProcessingRegistry;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StatusEvent {
    #[serde(rename = "status")]
    Status {
        #[serde(rename = "docId")]
        doc_id: String,
        status: String,
        #[serde(rename = "isProcessing")]
        is_processing: bool,
        #[serde(skip_serializing_if = "Option::is_none", rename = "processingStep")]
        processing_step: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<ProcessingProgress>,
        #[serde(skip_serializing_if = "Option::is_none", rename = "chunkCount")]
        chunk_count: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "error")]
    Error { error: String },
}

impl StatusEvent {
    pub fn from_metadata(metadata: &DocumentMetadata, is_processing: bool) -> Self {
        StatusEvent::Status {
            doc_id: metadata.doc_id.clone(),
            status: status_label(metadata.status).to_string(),
            is_processing,
            processing_step: metadata.processing_step.clone(),
            progress: metadata.progress.clone(),
            chunk_count: metadata.chunk_count,
            error: metadata.error.clone(),
        }
    }
}

fn status_label(status: crate::documents::metadata::DocumentStatus) -> &'static str {
    use crate::documents::metadata::DocumentStatus::*;
    match status {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Error => "error",
        Cancelled => "cancelled",
    }
}

/// What a subscriber wants to hear about: one or more docIds, or every
/// document belonging to a store.
#[derive(Debug, Clone)]
pub enum StatusFilter {
    DocIds(Vec<String>),
    StoreId(String),
}

impl StatusFilter {
    fn matches(&self, metadata: &DocumentMetadata) -> bool {
        match self {
            StatusFilter::DocIds(ids) => ids.iter().any(|id| id == &metadata.doc_id),
            StatusFilter::StoreId(store_id) => &metadata.store_id == store_id,
        }
    }
}

/// Broadcasts status events to all current and future subscribers.
/// Delivery is at-least-once: a slow subscriber that falls behind the
/// broadcast channel's buffer receives a `Lagged` gap and simply misses
/// those events, which is acceptable since clients deduplicate on docId +
/// status + progress.
pub struct StatusBus {
    sender: broadcast::Sender<(DocumentMetadata, bool)>,
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Publishes a metadata change. Safe to call even with zero subscribers.
    pub fn publish(&self, metadata: DocumentMetadata, is_processing: bool) {
        let _ = self.sender.send((metadata, is_processing));
    }

    /// Subscribes to events matching `filter`, after a full snapshot of the
    /// currently-matching documents so mid-stream joiners aren't missing
    /// state that changed before they connected.
    pub async fn subscribe(
        &self,
        filter: StatusFilter,
        metadata_store: &DocumentMetadataStore,
        registry: &ProcessingRegistry,
    ) -> Result<impl futures::Stream<Item = StatusEvent>> {
        let store_id_hint = match &filter {
            StatusFilter::StoreId(id) => Some(id.as_str()),
            StatusFilter::DocIds(_) => None,
        };
        let snapshot: Vec<StatusEvent> = metadata_store
            .list_document_metadata(store_id_hint)
            .await?
            .into_iter()
            .filter(|m| filter.matches(m))
            .map(|m| {
                let is_processing = registry.is_processing(&m.doc_id);
                StatusEvent::from_metadata(&m, is_processing)
            })
            .collect();

        if let StatusFilter::DocIds(ids) = &filter {
            if ids.is_empty() {
                return Err(CoreError::Validation("documentStatusEvents requires docIds or storeId".to_string()));
            }
        }

        let receiver = self.sender.subscribe();
        let live = async_stream::stream! {
            let mut receiver = receiver;
            loop {
                match receiver.recv().await {
                    Ok((metadata, is_processing)) => {
                        if filter.matches(&metadata) {
                            yield StatusEvent::from_metadata(&metadata, is_processing);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(futures::stream::iter(snapshot).chain(live))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn sample(doc_id: &str, store_id: &str) -> DocumentMetadata {
        DocumentMetadata {
            doc_id: doc_id.to_string(),
            store_id: store_id.to_string(),
            source_uri: "uri".to_string(),
            version: "1".to_string(),
            status: crate::documents::metadata::DocumentStatus::Pending,
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
    async fn subscribe_yields_snapshot_before_live_events() {
        let dir = tempdir().unwrap();
        let metadata_store = DocumentMetadataStore::new(PathBuf::from(dir.path()));
        metadata_store.store_document_metadata(&sample("doc1", "store1")).await.unwrap();
        let registry = ProcessingRegistry::new();
        let bus = StatusBus::new();

        let mut stream =
            Box::pin(bus.subscribe(StatusFilter::StoreId("store1".to_string()), &metadata_store, &registry).await.unwrap());

        let first = stream.next().await.unwrap();
        match first {
            StatusEvent::Status { doc_id, .. } => assert_eq!(doc_id, "doc1"),
            _ => panic!("expected status event"),
        }

        let mut updated = sample("doc1", "store1");
        updated.status = crate::documents::metadata::DocumentStatus::Completed;
        bus.publish(updated, false);

        let second = stream.next().await.unwrap();
        match second {
            StatusEvent::Status { status, .. } => assert_eq!(status, "completed"),
            _ => panic!("expected status event"),
        }
    }

    #[tokio::test]
    async fn subscribe_filters_out_non_matching_docs() {
        let dir = tempdir().unwrap();
        let metadata_store = DocumentMetadataStore::new(PathBuf::from(dir.path()));
        let registry = ProcessingRegistry::new();
        let bus = StatusBus::new();

        let mut stream = Box::pin(
            bus.subscribe(StatusFilter::DocIds(vec!["doc1".to_string()]), &metadata_store, &registry)
                .await
                .unwrap(),
        );

        bus.publish(sample("doc2", "store1"), false);
        bus.publish(sample("doc1", "store1"), false);

        let event = stream.next().await.unwrap();
        match event {
            StatusEvent::Status { doc_id, .. } => assert_eq!(doc_id, "doc1"),
            _ => panic!("expected status event"),
        }
    }

    #[tokio::test]
    async fn subscribe_rejects_empty_doc_id_filter() {
        let dir = tempdir().unwrap();
        let metadata_store = DocumentMetadataStore::new(PathBuf::from(dir.path()));
        let registry = ProcessingRegistry::new();
        let bus = StatusBus::new();

        let result = bus.subscribe(StatusFilter::DocIds(vec![]), &metadata_store, &registry).await;
        assert!(result.is_err());
    }
}
