//! Core service layer (§6): one method per operation in the external
//! interface table, thin enough to be reused by both the HTTP transport
//! (`api.rs`) and tests/an embedding binary without going through it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::cache::embedding::EmbeddingCache;
use crate::cache::enrichment::EnrichmentCache;
use crate::config::Config;
use crate::documents::metadata::{DocumentMetadata, DocumentMetadataStore, DocumentStatus, StatusPatch};
use crate::documents::storage::{create_document_id, DocumentStorage};
use crate::error::{CoreError, Result};
use crate::flow::{run_flow, EngineDeps, FlowEvent, Graph, RunOptions};
use crate::ingestion::pipeline::{run_with_status_recovery, Pipeline, PipelineInput};
use crate::llm::provider::LlmProvider;
use crate::registry::ProcessingRegistry;
use crate::status::{StatusBus, StatusEvent, StatusFilter};
use crate::store::{reciprocal_rank_fusion, validate_store_id, QueryResult, UpsertItem, VectorStoreBackend};
use crate::usage::UsageLedger;

/// Everything the operation handlers need. One instance is shared across
/// every request (wrapped in `Arc` by the binary/transport layer).
pub struct Core {
    pub config: Config,
    pub document_storage: Arc<DocumentStorage>,
    pub metadata_store: Arc<DocumentMetadataStore>,
    pub registry: Arc<ProcessingRegistry>,
    pub status_bus: Arc<StatusBus>,
    pub provider: Arc<dyn LlmProvider>,
    pub embedding_cache: Arc<EmbeddingCache>,
    pub enrichment_cache: Arc<EnrichmentCache>,
    pub usage_ledger: Arc<UsageLedger>,
    pub stores: tokio::sync::RwLock<HashMap<String, Arc<dyn VectorStoreBackend>>>,
    pub content_dir: PathBuf,
}

impl Core {
    async fn store_for(&self, store_id: &str) -> Result<Arc<dyn VectorStoreBackend>> {
        validate_store_id(store_id)?;
        if let Some(store) = self.stores.read().await.get(store_id) {
            return Ok(store.clone());
        }
        let mut stores = self.stores.write().await;
        if let Some(store) = stores.get(store_id) {
            return Ok(store.clone());
        }
        let store: Arc<dyn VectorStoreBackend> = if self.config.storage.use_vectra {
            Arc::new(crate::store::local_index_backend::LocalIndexVectorStore::new(
                self.content_dir.join("vectorstores").join(format!("{store_id}.vectra")),
            ))
        } else {
            Arc::new(crate::store::json_backend::JsonVectorStore::new(
                self.content_dir.join("vectorstores").join(format!("{store_id}.json")),
            ))
        };
        stores.insert(store_id.to_string(), store.clone());
        Ok(store)
    }

    async fn publish_status(&self, doc_id: &str) {
        if let Ok(metadata) = self.metadata_store.read_document_metadata(doc_id).await {
            self.status_bus.publish(metadata, self.registry.is_processing(doc_id));
        }
    }

    /// Snapshot of currently-known stores for a flow run. `runFlow` graphs
    /// reference stores by id through Rag nodes; any store not yet touched
    /// by an ingestion/upsert call in this process is simply absent.
    pub async fn engine_deps(&self) -> EngineDeps {
        EngineDeps {
            provider: self.provider.clone(),
            stores: self.stores.read().await.clone(),
            embedding_cache: self.embedding_cache.clone(),
            document_storage: self.document_storage.clone(),
            usage_ledger: self.usage_ledger.clone(),
            embedding_model: self.config.provider.embedding_model.clone(),
            default_store_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadDocumentRequest {
    pub store_id: String,
    pub source_uri: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadDocumentResponse {
    pub doc_id: String,
    pub store_id: String,
    pub source_uri: String,
    pub version: String,
    pub status: &'static str,
    pub uploaded_at: chrono::DateTime<Utc>,
}

pub async fn upload_document(core: &Core, request: UploadDocumentRequest) -> Result<UploadDocumentResponse> {
    if request.source_uri.is_empty() || request.bytes.is_empty() {
        return Err(CoreError::Validation("sourceUri and bytes are required".to_string()));
    }
    validate_store_id(&request.store_id)?;

    let content_hash = {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&request.bytes);
        format!("{:x}", hasher.finalize())
    };
    let doc_id = create_document_id(&request.source_uri, Some(&content_hash));
    let version = Utc::now().timestamp_millis().to_string();

    core.document_storage.store_document(&doc_id, &version, &request.bytes).await?;

    let metadata = DocumentMetadata {
        doc_id: doc_id.clone(),
        store_id: request.store_id.clone(),
        source_uri: request.source_uri.clone(),
        version: version.clone(),
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
    };
    core.metadata_store.store_document_metadata(&metadata).await?;
    core.publish_status(&doc_id).await;

    Ok(UploadDocumentResponse {
        doc_id,
        store_id: request.store_id,
        source_uri: request.source_uri,
        version,
        status: "pending",
        uploaded_at: metadata.uploaded_at,
    })
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartProcessingRequest {
    pub doc_id: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged, rename_all = "camelCase")]
pub enum StartProcessingResponse {
    Started { doc_id: String, started: bool, status: &'static str },
    AlreadyProcessing { already_processing: bool },
}

/// Starts an ingestion job in the background; returns immediately once
/// metadata is flipped to `processing` and the job is registered.
pub async fn start_processing(core: Arc<Core>, request: StartProcessingRequest) -> Result<StartProcessingResponse> {
    if core.registry.is_processing(&request.doc_id) {
        return Ok(StartProcessingResponse::AlreadyProcessing { already_processing: true });
    }

    let metadata = core.metadata_store.read_document_metadata(&request.doc_id).await?;
    let handle = core.registry.register(&request.doc_id).await;

    core.metadata_store
        .update_document_status(
            &request.doc_id,
            DocumentStatus::Processing,
            StatusPatch {
                processing_step: Some("queued".to_string()),
                ..Default::default()
            },
        )
        .await?;
    core.publish_status(&request.doc_id).await;

    let doc_id = request.doc_id.clone();
    let store_id = metadata.store_id.clone();
    let author = request.author;
    let description = request.description;
    let tags = request.tags;
    tokio::spawn(async move {
        let read = match core.document_storage.read_document(&doc_id, Some(&metadata.version)).await {
            Ok(r) => r,
            Err(e) => {
                let _ = core
                    .metadata_store
                    .update_document_status(&doc_id, DocumentStatus::Error, StatusPatch { error: Some(e.to_string()), ..Default::default() })
                    .await;
                core.registry.unregister(&doc_id);
                core.publish_status(&doc_id).await;
                return;
            }
        };
        let content = String::from_utf8_lossy(&read.content).into_owned();
        let store = match core.store_for(&store_id).await {
            Ok(s) => s,
            Err(e) => {
                let _ = core
                    .metadata_store
                    .update_document_status(&doc_id, DocumentStatus::Error, StatusPatch { error: Some(e.to_string()), ..Default::default() })
                    .await;
                core.registry.unregister(&doc_id);
                core.publish_status(&doc_id).await;
                return;
            }
        };

        let pipeline = Pipeline {
            config: core.config.ingestion_config(),
            store,
            embedding_cache: core.embedding_cache.clone(),
            enrichment_cache: core.enrichment_cache.clone(),
            metadata_store: core.metadata_store.clone(),
            provider: core.provider.clone(),
            usage_ledger: core.usage_ledger.clone(),
        };

        let input = PipelineInput {
            doc_id: &doc_id,
            store_id: &store_id,
            source_uri: &metadata.source_uri,
            content: &content,
            version: &metadata.version,
            doc_author: author.as_deref(),
            doc_description: description.as_deref(),
            doc_tags: &tags,
        };

        let _ = run_with_status_recovery(&pipeline, input, &handle.cancel).await;
        core.registry.unregister(&doc_id);
        core.publish_status(&doc_id).await;
    });

    Ok(StartProcessingResponse::Started { doc_id: request.doc_id, started: true, status: "processing" })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelProcessingResponse {
    pub cancelled: bool,
}

pub async fn cancel_processing(core: &Core, doc_id: &str) -> Result<CancelProcessingResponse> {
    core.metadata_store.read_document_metadata(doc_id).await?;
    core.registry.cancel(doc_id);
    Ok(CancelProcessingResponse { cancelled: true })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprocessDocumentResponse {
    pub doc_id: String,
    pub reprocessing: bool,
    pub chunks_deleted: usize,
}

/// Deletes this document's chunks from its store, then starts a fresh
/// processing run over the same stored bytes.
pub async fn reprocess_document(core: Arc<Core>, doc_id: &str) -> Result<ReprocessDocumentResponse> {
    let metadata = core.metadata_store.read_document_metadata(doc_id).await?;
    let store = core.store_for(&metadata.store_id).await?;
    let all = store.list().await?;
    let stale_ids: Vec<String> = all
        .into_iter()
        .filter(|item| item.metadata.get("doc_id").and_then(|v| v.as_str()) == Some(doc_id))
        .map(|item| item.id)
        .collect();
    let chunks_deleted = store.delete(&stale_ids).await?;
    core.enrichment_cache.delete_by_doc_id(doc_id).await?;

    start_processing(
        core,
        StartProcessingRequest {
            doc_id: doc_id.to_string(),
            author: metadata.author,
            description: metadata.description,
            tags: metadata.tags,
        },
    )
    .await?;

    Ok(ReprocessDocumentResponse { doc_id: doc_id.to_string(), reprocessing: true, chunks_deleted })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteDocumentResponse {
    pub deleted: bool,
}

pub async fn delete_document(core: &Core, doc_id: &str, store_id: &str) -> Result<DeleteDocumentResponse> {
    core.registry.cancel(doc_id);
    let store = core.store_for(store_id).await?;
    let all = store.list().await?;
    let ids: Vec<String> = all
        .into_iter()
        .filter(|item| item.metadata.get("doc_id").and_then(|v| v.as_str()) == Some(doc_id))
        .map(|item| item.id)
        .collect();
    store.delete(&ids).await?;
    core.enrichment_cache.delete_by_doc_id(doc_id).await?;
    core.document_storage.delete_document(doc_id).await?;
    core.metadata_store.delete_document_metadata(doc_id).await?;
    Ok(DeleteDocumentResponse { deleted: true })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDocumentsResponse {
    pub documents: Vec<DocumentMetadata>,
}

pub async fn list_documents(core: &Core, store_id: Option<&str>) -> Result<ListDocumentsResponse> {
    Ok(ListDocumentsResponse { documents: core.metadata_store.list_document_metadata(store_id).await? })
}

pub async fn document_status_events(core: &Core, filter: StatusFilter) -> Result<impl Stream<Item = StatusEvent>> {
    core.status_bus.subscribe(filter, &core.metadata_store, &core.registry).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertItemRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertRequest {
    pub store_id: String,
    pub items: Vec<UpsertItemRequest>,
    pub model: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertResponse {
    pub store_id: String,
    pub inserted: usize,
    pub updated: usize,
    pub count: usize,
}

pub async fn upsert(core: &Core, request: UpsertRequest) -> Result<UpsertResponse> {
    let store = core.store_for(&request.store_id).await?;
    let texts: Vec<String> = request.items.iter().map(|i| i.text.clone()).collect();
    let cached = core.embedding_cache.get_many(&texts, &request.model).await;

    let mut items = Vec::with_capacity(request.items.len());
    let mut fresh = Vec::new();
    for (item, cached_embedding) in request.items.into_iter().zip(cached.into_iter()) {
        let embedding = match cached_embedding {
            Some(v) => v,
            None => {
                let response = core.provider.embed(&request.model, &item.text).await?;
                fresh.push((item.text.clone(), response.embedding.clone()));
                response.embedding
            }
        };
        items.push(UpsertItem { id: item.id, text: item.text, embedding, metadata: item.metadata });
    }
    if !fresh.is_empty() {
        core.embedding_cache.set_many(fresh, &request.model).await?;
    }

    let summary = store.upsert(items).await?;
    Ok(UpsertResponse {
        store_id: request.store_id,
        inserted: summary.inserted,
        updated: summary.updated,
        count: summary.count,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryManyRequest {
    pub store_id: String,
    pub queries: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub top_k: Option<usize>,
    /// When true, fuse per-query result lists via reciprocal-rank fusion
    /// instead of returning them separately (§6 `queryMany` note).
    #[serde(default)]
    pub fuse: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryManyResponse {
    pub queries: Vec<String>,
    pub results: Vec<Vec<QueryResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fused: Option<Vec<QueryResult>>,
}

pub async fn query_many(core: &Core, request: QueryManyRequest) -> Result<QueryManyResponse> {
    let store = core.store_for(&request.store_id).await?;
    let model = request.model.unwrap_or_else(|| core.config.provider.embedding_model.clone());
    let top_k = request.top_k.unwrap_or(5);

    let mut vectors = Vec::with_capacity(request.queries.len());
    for query in &request.queries {
        let embedding = match core.embedding_cache.get(query, &model).await {
            Some(v) => v,
            None => {
                let response = core.provider.embed(&model, query).await?;
                core.embedding_cache.set(query, response.embedding.clone(), &model).await?;
                response.embedding
            }
        };
        vectors.push(embedding);
    }

    let results = store.query_many(&vectors, top_k).await?;
    let fused = if request.fuse { Some(reciprocal_rank_fusion(&results, 60)) } else { None };

    Ok(QueryManyResponse { queries: request.queries, results, fused })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub deleted: usize,
}

pub async fn delete(core: &Core, store_id: &str, ids: &[String]) -> Result<DeleteResponse> {
    let store = core.store_for(store_id).await?;
    Ok(DeleteResponse { deleted: store.delete(ids).await? })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub items: Vec<crate::store::VectorStoreItem>,
}

pub async fn list(core: &Core, store_id: &str) -> Result<ListResponse> {
    let store = core.store_for(store_id).await?;
    Ok(ListResponse { items: store.list().await? })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSummary {
    pub id: String,
    pub text: String,
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunksOfDocumentResponse {
    pub chunks: Vec<ChunkSummary>,
}

pub async fn chunks_of_document(core: &Core, doc_id: &str, store_id: &str) -> Result<ChunksOfDocumentResponse> {
    let store = core.store_for(store_id).await?;
    let all = store.list().await?;
    let chunks = all
        .into_iter()
        .filter(|item| item.metadata.get("doc_id").and_then(|v| v.as_str()) == Some(doc_id))
        .map(|item| ChunkSummary { id: item.id, text: item.text, metadata: item.metadata })
        .collect();
    Ok(ChunksOfDocumentResponse { chunks })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFlowRequest {
    pub graph: Graph,
    #[serde(default)]
    pub user_message: Option<String>,
    #[serde(default)]
    pub initial_vars: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    pub start_edge_id: Option<String>,
    #[serde(default)]
    pub start_node_id: Option<String>,
}

/// Runs a flow graph, returning the raw event stream (§6 `runFlow`:
/// "streamed callbacks") for the transport layer to relay as SSE.
pub fn run_flow_operation(
    engine_deps: Arc<EngineDeps>,
    request: RunFlowRequest,
    cancel: CancellationToken,
) -> std::pin::Pin<Box<dyn Stream<Item = Result<FlowEvent>> + Send>> {
    let options = RunOptions {
        user_message: request.user_message,
        initial_vars: request.initial_vars,
        start_edge_id: request.start_edge_id,
        start_node_id: request.start_node_id,
        initial_state: None,
        run_id: Some(uuid::Uuid::new_v4().to_string()),
    };
    run_flow(engine_deps, request.graph, options, cancel)
}
