use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::answer::AnswerEngine;
use crate::config::{AppConfig, UploadConfig};
use crate::db::Database;
use crate::error::AppError;
use crate::ingest::Ingestor;
use crate::models::{
    Answer, DeleteResponse, DependencyStatus, DocumentPage, DocumentStats, HealthResponse,
    QueryRecord, QueryRequest, SearchRequest, SearchResponse, UploadResponse, UploadedFile,
};
use crate::openai::OpenAiClient;
use crate::qdrant_store::QdrantStore;
use crate::retrieval::Retriever;
use crate::ui;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;
const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub ingestor: Ingestor,
    pub engine: AnswerEngine,
}

impl AppState {
    pub fn new(config: AppConfig, ingestor: Ingestor, engine: AnswerEngine) -> Self {
        Self {
            config: Arc::new(config),
            ingestor,
            engine,
        }
    }

    /// Connects the database and wires the hosted clients. Nothing is called
    /// on the hosted services yet; the collection is created on first upsert.
    pub async fn from_config(config: AppConfig) -> crate::error::Result<Self> {
        let db = Database::new(&config).await?;
        let models = Arc::new(OpenAiClient::new(&config.models, &config.http)?);
        let index = Arc::new(QdrantStore::new(&config.vector, &config.http)?);
        let retriever = Retriever::new(db, models.clone(), index);

        let ingestor = Ingestor::new(config.chunking, config.upload.clone(), retriever.clone());
        let generation_limit = Arc::new(Semaphore::new(config.http.max_concurrent_generations));
        let engine = AnswerEngine::new(retriever, models, config.retrieval, generation_limit);

        Ok(Self::new(config, ingestor, engine))
    }

    pub fn db(&self) -> &Database {
        self.engine.retriever().db()
    }
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.max_request_bytes();

    Router::new()
        .merge(ui::routes())
        .route(
            "/api/documents",
            get(list_documents).post(upload_documents),
        )
        .route("/api/documents/:id", delete(delete_document))
        .route("/api/documents/:id/stats", get(document_stats))
        .route("/api/query", post(query_handler))
        .route("/api/search", get(search_handler))
        .route("/api/history", get(list_history))
        .route("/api/history/:id", get(get_history))
        .route("/health", get(health))
        .nest_service("/static", ServeDir::new("static"))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let addr: SocketAddr = state
        .config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {}", state.config.bind_addr))?;
    let app = build_router(state);

    tracing::info!("listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Reads the `file`/`files` parts of an upload form. Parts without a file
/// name (an empty file input) are skipped. A part is buffered up to one byte
/// past the per-file limit and the rest is discarded, so the size check in
/// `validate_upload` still rejects it.
pub(crate) async fn read_uploads(
    mut multipart: Multipart,
    upload: &UploadConfig,
) -> Result<Vec<UploadedFile>, AppError> {
    let max_files = upload.max_files_per_upload;
    let keep = usize::try_from(upload.max_file_size_bytes())
        .unwrap_or(usize::MAX)
        .saturating_add(1);

    let mut files = Vec::new();
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::Validation(format!("malformed upload: {err}")))?
    {
        if !matches!(field.name(), Some("file") | Some("files")) {
            continue;
        }
        let filename = match field.file_name() {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => continue,
        };
        if files.len() == max_files {
            return Err(AppError::Validation(format!(
                "more than {max_files} files in one upload"
            )));
        }
        let content_type = field.content_type().map(str::to_string);

        let mut bytes = Vec::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|err| AppError::Validation(format!("{filename}: {err}")))?
        {
            let room = keep - bytes.len();
            bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if bytes.len() == keep {
                tracing::warn!(
                    "{}: upload exceeds the size limit, discarding the rest",
                    filename
                );
                break;
            }
        }
        files.push(UploadedFile {
            filename,
            content_type,
            bytes,
        });
    }
    Ok(files)
}

async fn upload_documents(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let files = read_uploads(multipart, &state.config.upload).await?;
    let results = state.ingestor.ingest_batch(files).await?;
    Ok(Json(UploadResponse { results }))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PageParams {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

impl PageParams {
    pub(crate) fn resolve(&self) -> Result<(i64, i64), AppError> {
        let offset = self.offset.unwrap_or(0);
        if offset < 0 {
            return Err(AppError::Validation("offset must not be negative".to_string()));
        }
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if limit < 1 {
            return Err(AppError::Validation("limit must be at least 1".to_string()));
        }
        Ok((offset, limit.min(MAX_PAGE_SIZE)))
    }
}

pub(crate) async fn document_page(
    db: &Database,
    params: &PageParams,
) -> Result<DocumentPage, AppError> {
    let (offset, limit) = params.resolve()?;
    Ok(DocumentPage {
        documents: db.list_documents(offset, limit).await?,
        total: db.count_documents().await?,
        offset,
        limit,
    })
}

async fn list_documents(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Json<DocumentPage>, ApiError> {
    Ok(Json(document_page(state.db(), &params).await?))
}

async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DeleteResponse>, ApiError> {
    state.ingestor.delete_document(id).await?;
    Ok(Json(DeleteResponse {
        document_id: id,
        deleted: true,
    }))
}

async fn document_stats(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DocumentStats>, ApiError> {
    Ok(Json(state.ingestor.document_stats(id).await?))
}

async fn query_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<Answer>, ApiError> {
    Ok(Json(state.engine.answer(request).await?))
}

async fn search_handler(
    State(state): State<AppState>,
    Query(request): Query<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    Ok(Json(state.engine.search(request).await?))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct HistoryParams {
    pub limit: Option<i64>,
}

impl HistoryParams {
    pub(crate) fn resolve(&self) -> Result<i64, AppError> {
        match self.limit {
            Some(limit) if limit < 1 => Err(AppError::Validation(
                "limit must be at least 1".to_string(),
            )),
            Some(limit) => Ok(limit.min(MAX_HISTORY_LIMIT)),
            None => Ok(DEFAULT_HISTORY_LIMIT),
        }
    }
}

async fn list_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<QueryRecord>>, ApiError> {
    let limit = params.resolve()?;
    Ok(Json(state.db().list_query_records(limit).await?))
}

async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<QueryRecord>, ApiError> {
    Ok(Json(state.db().get_query_record(id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct HealthParams {
    deep: Option<bool>,
}

async fn health(
    State(state): State<AppState>,
    Query(params): Query<HealthParams>,
) -> (StatusCode, Json<HealthResponse>) {
    if !params.deep.unwrap_or(false) {
        return (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok".to_string(),
                timestamp: Utc::now(),
                dependencies: vec![],
            }),
        );
    }

    let retriever = state.engine.retriever();
    let (database, index, embedding, model) = tokio::join!(
        retriever.db().ping(),
        retriever.index().health(),
        retriever.embedder().health(),
        state.engine.model().health(),
    );
    let dependencies = vec![
        dependency("database", database),
        dependency("vector_index", index),
        dependency("embedding", embedding),
        dependency("language_model", model),
    ];

    let healthy = dependencies.iter().all(|dep| dep.reachable);
    let (status, label) = if healthy {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            timestamp: Utc::now(),
            dependencies,
        }),
    )
}

fn dependency(name: &str, result: Result<(), AppError>) -> DependencyStatus {
    match result {
        Ok(()) => DependencyStatus {
            name: name.to_string(),
            reachable: true,
            error: None,
        },
        Err(err) => {
            tracing::warn!("health check: {} unreachable: {}", name, err);
            DependencyStatus {
                name: name.to_string(),
                reachable: false,
                error: Some(err.to_string()),
            }
        }
    }
}

pub(crate) fn status_for(err: &AppError) -> StatusCode {
    match err {
        AppError::Validation(_) => StatusCode::BAD_REQUEST,
        AppError::DuplicateDocument { .. } => StatusCode::CONFLICT,
        AppError::Extraction(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AppError::Service {
            transient: true, ..
        } => StatusCode::SERVICE_UNAVAILABLE,
        AppError::Service { .. } => StatusCode::BAD_GATEWAY,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::Database(_)
        | AppError::Config(_)
        | AppError::Io(_)
        | AppError::Serialization(_)
        | AppError::Template(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<AppError> for ApiError {
    fn from(value: AppError) -> Self {
        let status = status_for(&value);
        if status.is_server_error() {
            tracing::error!("request failed: {}", value);
        }
        Self {
            status,
            message: value.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}
