//! HTTP/SSE transport binding (§6a): thin axum handlers over the
//! `operations` service layer, matching the donor platform's
//! `AppState`/`ApiError`/`create_router` shape.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;
use utoipa::{OpenApi, ToSchema};

use crate::error::{CoreError, ErrorCategory};
use crate::operations::{self, Core, RunFlowRequest, StartProcessingRequest, UploadDocumentRequest, UpsertRequest};
use crate::status::{StatusEvent, StatusFilter};

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<Core>,
}

/// Wraps [`CoreError`] so `?` composes in handlers; maps onto HTTP status
/// via the taxonomy in §7.
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.category() {
            ErrorCategory::Validation => StatusCode::BAD_REQUEST,
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::Conflict => StatusCode::CONFLICT,
            ErrorCategory::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            ErrorCategory::ProviderError => StatusCode::BAD_GATEWAY,
            ErrorCategory::Corrupt | ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "internal error serving request");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize, ToSchema)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// OpenAPI documentation. Only the health endpoint is annotated; the §6
/// operation handlers are thin enough that their request/response shapes
/// live in `operations.rs` and aren't worth a parallel schema surface yet.
#[derive(OpenApi)]
#[openapi(
    paths(health_handler),
    components(schemas(HealthResponse)),
    tags((name = "health", description = "Health check endpoints")),
    info(title = "zoeflow-core API", version = "0.1.0")
)]
struct ApiDoc;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/openapi.json", get(openapi_spec_handler))
        .route("/api/v1/documents", post(upload_document_handler).get(list_documents_handler))
        .route("/api/v1/documents/{docId}/process", post(start_processing_handler))
        .route("/api/v1/documents/{docId}/cancel", post(cancel_processing_handler))
        .route("/api/v1/documents/{docId}/reprocess", post(reprocess_document_handler))
        .route("/api/v1/documents/{docId}", axum::routing::delete(delete_document_handler))
        .route("/api/v1/documents/{docId}/events", get(document_status_events_handler))
        .route("/api/v1/documents/{docId}/chunks", get(chunks_of_document_handler))
        .route("/api/v1/store/upsert", post(upsert_handler))
        .route("/api/v1/store/query", post(query_many_handler))
        .route("/api/v1/store/{storeId}/delete", post(delete_handler))
        .route("/api/v1/store/{storeId}/items", get(list_items_handler))
        .route("/api/v1/flows/run", post(run_flow_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[utoipa::path(get, path = "/health", tag = "health", responses((status = 200, body = HealthResponse)))]
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION") })
}

async fn openapi_spec_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

async fn upload_document_handler(
    State(state): State<AppState>,
    Json(request): Json<UploadDocumentRequest>,
) -> ApiResult<Json<operations::UploadDocumentResponse>> {
    Ok(Json(operations::upload_document(&state.core, request).await?))
}

#[derive(Deserialize)]
struct StoreIdQuery {
    #[serde(rename = "storeId")]
    store_id: Option<String>,
}

async fn list_documents_handler(
    State(state): State<AppState>,
    Query(query): Query<StoreIdQuery>,
) -> ApiResult<Json<operations::ListDocumentsResponse>> {
    Ok(Json(operations::list_documents(&state.core, query.store_id.as_deref()).await?))
}

#[derive(Deserialize, Default)]
struct StartProcessingBody {
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

async fn start_processing_handler(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
    Json(body): Json<StartProcessingBody>,
) -> ApiResult<Json<operations::StartProcessingResponse>> {
    let request = StartProcessingRequest { doc_id, author: body.author, description: body.description, tags: body.tags };
    Ok(Json(operations::start_processing(state.core, request).await?))
}

async fn cancel_processing_handler(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> ApiResult<Json<operations::CancelProcessingResponse>> {
    Ok(Json(operations::cancel_processing(&state.core, &doc_id).await?))
}

async fn reprocess_document_handler(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> ApiResult<Json<operations::ReprocessDocumentResponse>> {
    Ok(Json(operations::reprocess_document(state.core, &doc_id).await?))
}

async fn delete_document_handler(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
    Query(query): Query<StoreIdQuery>,
) -> ApiResult<Json<operations::DeleteDocumentResponse>> {
    let store_id = query.store_id.ok_or_else(|| CoreError::Validation("storeId query parameter is required".to_string()))?;
    Ok(Json(operations::delete_document(&state.core, &doc_id, &store_id).await?))
}

#[derive(Deserialize)]
struct DocIdsOrStoreQuery {
    #[serde(default, rename = "docIds")]
    doc_ids: Option<String>,
    #[serde(default, rename = "storeId")]
    store_id: Option<String>,
}

async fn document_status_events_handler(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
    Query(query): Query<DocIdsOrStoreQuery>,
) -> ApiResult<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let filter = if let Some(store_id) = query.store_id {
        StatusFilter::StoreId(store_id)
    } else if let Some(doc_ids) = query.doc_ids {
        StatusFilter::DocIds(doc_ids.split(',').map(str::to_string).collect())
    } else {
        StatusFilter::DocIds(vec![doc_id])
    };

    let events = operations::document_status_events(&state.core, filter).await?;
    let sse_stream = events.map(|event| Ok(status_event_to_sse(&event)));
    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn status_event_to_sse(event: &StatusEvent) -> Event {
    Event::default().json_data(event).unwrap_or_else(|_| Event::default().data("{\"type\":\"error\"}"))
}

async fn chunks_of_document_handler(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
    Query(query): Query<StoreIdQuery>,
) -> ApiResult<Json<operations::ChunksOfDocumentResponse>> {
    let store_id = query.store_id.ok_or_else(|| CoreError::Validation("storeId query parameter is required".to_string()))?;
    Ok(Json(operations::chunks_of_document(&state.core, &doc_id, &store_id).await?))
}

async fn upsert_handler(
    State(state): State<AppState>,
    Json(request): Json<UpsertRequest>,
) -> ApiResult<Json<operations::UpsertResponse>> {
    Ok(Json(operations::upsert(&state.core, request).await?))
}

async fn query_many_handler(
    State(state): State<AppState>,
    Json(request): Json<operations::QueryManyRequest>,
) -> ApiResult<Json<operations::QueryManyResponse>> {
    Ok(Json(operations::query_many(&state.core, request).await?))
}

#[derive(Deserialize)]
struct DeleteBody {
    ids: Vec<String>,
}

async fn delete_handler(
    State(state): State<AppState>,
    Path(store_id): Path<String>,
    Json(body): Json<DeleteBody>,
) -> ApiResult<Json<operations::DeleteResponse>> {
    Ok(Json(operations::delete(&state.core, &store_id, &body.ids).await?))
}

async fn list_items_handler(
    State(state): State<AppState>,
    Path(store_id): Path<String>,
) -> ApiResult<Json<operations::ListResponse>> {
    Ok(Json(operations::list(&state.core, &store_id).await?))
}

async fn run_flow_handler(
    State(state): State<AppState>,
    Json(request): Json<RunFlowRequest>,
) -> ApiResult<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let deps = Arc::new(state.core.engine_deps().await);
    let cancel = CancellationToken::new();
    let events = operations::run_flow_operation(deps, request, cancel);
    let sse_stream = events.map(|event| {
        Ok(match event {
            Ok(flow_event) => Event::default().json_data(&flow_event).unwrap_or_else(|_| Event::default().data("{}")),
            Err(e) => Event::default().event("error").data(e.to_string()),
        })
    });
    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}
