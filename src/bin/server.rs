//! Binary entry point: wires the collaborators into a `Core`, recovers
//! any jobs interrupted by a prior restart, and serves the HTTP/SSE API.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

use zoeflow_core::api::{create_router, AppState};
use zoeflow_core::cache::embedding::EmbeddingCache;
use zoeflow_core::cache::enrichment::EnrichmentCache;
use zoeflow_core::config::Config;
use zoeflow_core::documents::{DocumentMetadataStore, DocumentStorage};
use zoeflow_core::llm::OpenRouterProvider;
use zoeflow_core::operations::Core;
use zoeflow_core::registry::{recover_stale_jobs, ProcessingRegistry};
use zoeflow_core::status::StatusBus;
use zoeflow_core::usage::UsageLedger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::var("ZOEFLOW_CONFIG").ok().map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let content_dir = PathBuf::from(&config.storage.content_dir);
    tokio::fs::create_dir_all(&content_dir).await?;

    let document_storage = Arc::new(DocumentStorage::new(content_dir.join("documents")));
    let metadata_store = Arc::new(DocumentMetadataStore::new(content_dir.join("metadata")));
    let embedding_cache = Arc::new(EmbeddingCache::new(content_dir.join("cache").join("embeddings.json")));
    let enrichment_cache = Arc::new(EnrichmentCache::new(content_dir.join("cache").join("enrichment.json")));
    let usage_ledger = Arc::new(UsageLedger::new(content_dir.join("usage.json")));
    let registry = Arc::new(ProcessingRegistry::new());
    let status_bus = Arc::new(StatusBus::new());

    let provider = Arc::new(OpenRouterProvider::new(
        config.provider.base_url.clone(),
        config.provider.api_key.clone(),
        config.provider.completion_model.clone(),
        60,
    ));

    let recovered = recover_stale_jobs(&metadata_store).await?;
    if recovered > 0 {
        tracing::warn!(count = recovered, "recovered jobs interrupted by a prior restart");
    }

    let core = Arc::new(Core {
        config,
        document_storage,
        metadata_store,
        registry,
        status_bus,
        provider,
        embedding_cache,
        enrichment_cache,
        usage_ledger,
        stores: RwLock::new(HashMap::new()),
        content_dir,
    });

    let app = create_router(AppState { core });

    let addr = std::env::var("ZOEFLOW_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "zoeflow-core listening");
    axum::serve(listener, app).await?;
    Ok(())
}
