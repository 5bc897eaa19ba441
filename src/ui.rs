//! Server-rendered pages. Every page is an askama template fed with small
//! view structs holding preformatted strings.

use std::str::FromStr;

use askama::Template;
use axum::extract::{Form, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::models::{
    Answer, AnswerOutcome, Document, DocumentPage, DocumentStats, QueryRecord, QueryRequest,
    UploadOutcome,
};
use crate::server::{document_page, read_uploads, status_for, AppState, PageParams};

const HISTORY_PAGE_SIZE: i64 = 50;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(ask_page).post(ask))
        .route("/documents", get(library).post(upload))
        .route("/documents/:id", get(document_detail))
        .route("/documents/:id/delete", post(delete_document))
        .route("/history", get(history))
        .route("/settings", get(settings))
}

struct SourceView {
    number: usize,
    filename: String,
    location: String,
    score: String,
    snippet: String,
}

struct AnswerView {
    text: String,
    answered: bool,
    confidence: String,
    response_time: String,
    sources: Vec<SourceView>,
}

impl From<&Answer> for AnswerView {
    fn from(answer: &Answer) -> Self {
        Self {
            text: answer.answer.clone(),
            answered: answer.outcome == AnswerOutcome::Answered,
            confidence: format!("{:.0}%", answer.confidence * 100.0),
            response_time: format!("{} ms", answer.response_time_ms),
            sources: answer
                .sources
                .iter()
                .map(|source| SourceView {
                    number: source.source_id,
                    filename: source.filename.clone(),
                    location: match source.page {
                        Some(page) => format!("page {page}, chunk {}", source.ordinal + 1),
                        None => format!("chunk {}", source.ordinal + 1),
                    },
                    score: format!("{:.3}", source.score),
                    snippet: source.snippet.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    question: String,
    top_k: String,
    confidence_threshold: String,
    default_top_k: usize,
    default_threshold: String,
    answer: Option<AnswerView>,
    error: Option<String>,
}

impl IndexTemplate {
    fn new(config: &AppConfig) -> Self {
        Self {
            question: String::new(),
            top_k: String::new(),
            confidence_threshold: String::new(),
            default_top_k: config.retrieval.top_k,
            default_threshold: format!("{:.2}", config.retrieval.confidence_threshold),
            answer: None,
            error: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AskForm {
    question: String,
    #[serde(default)]
    top_k: String,
    #[serde(default)]
    confidence_threshold: String,
}

impl AskForm {
    fn to_request(&self) -> Result<QueryRequest, AppError> {
        Ok(QueryRequest {
            question: self.question.clone(),
            top_k: parse_optional(&self.top_k, "top_k")?,
            confidence_threshold: parse_optional(&self.confidence_threshold, "confidence threshold")?,
            document_ids: None,
        })
    }
}

fn parse_optional<T: FromStr>(raw: &str, field: &str) -> Result<Option<T>, AppError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| AppError::Validation(format!("{field} '{raw}' is not a number")))
}

async fn ask_page(State(state): State<AppState>) -> Result<Html<String>, UiError> {
    render(IndexTemplate::new(&state.config))
}

async fn ask(
    State(state): State<AppState>,
    Form(form): Form<AskForm>,
) -> Result<Html<String>, UiError> {
    let mut page = IndexTemplate::new(&state.config);
    page.question = form.question.clone();
    page.top_k = form.top_k.trim().to_string();
    page.confidence_threshold = form.confidence_threshold.trim().to_string();

    let outcome = match form.to_request() {
        Ok(request) => state.engine.answer(request).await,
        Err(err) => Err(err),
    };
    match outcome {
        Ok(answer) => page.answer = Some(AnswerView::from(&answer)),
        Err(AppError::Validation(message)) => page.error = Some(message),
        Err(err) => return Err(err.into()),
    }
    render(page)
}

struct DocumentRow {
    id: i64,
    filename: String,
    title: String,
    author: String,
    pages: i64,
    size: String,
    status: String,
    message: String,
    uploaded: String,
}

impl From<&Document> for DocumentRow {
    fn from(doc: &Document) -> Self {
        Self {
            id: doc.id,
            filename: doc.filename.clone(),
            title: doc.title.clone().unwrap_or_default(),
            author: doc.author.clone().unwrap_or_default(),
            pages: doc.page_count,
            size: format_bytes(doc.file_size),
            status: doc.status.as_str().to_string(),
            message: doc.status_message.clone().unwrap_or_default(),
            uploaded: format_time(&doc.uploaded_at),
        }
    }
}

struct OutcomeRow {
    filename: String,
    status: String,
    detail: String,
}

impl From<&UploadOutcome> for OutcomeRow {
    fn from(outcome: &UploadOutcome) -> Self {
        let detail = match (&outcome.message, outcome.document_id) {
            (Some(message), _) => message.clone(),
            (None, Some(id)) => format!("document {id}, {} chunks", outcome.chunk_count),
            (None, None) => String::new(),
        };
        Self {
            filename: outcome.filename.clone(),
            status: outcome.status.as_str().to_string(),
            detail,
        }
    }
}

#[derive(Template)]
#[template(path = "documents.html")]
struct LibraryTemplate {
    rows: Vec<DocumentRow>,
    total: i64,
    first: i64,
    last: i64,
    prev_offset: Option<i64>,
    next_offset: Option<i64>,
    outcomes: Vec<OutcomeRow>,
    error: Option<String>,
    max_file_size_mb: u64,
    max_files: usize,
    accept: String,
}

impl LibraryTemplate {
    fn new(config: &AppConfig, page: DocumentPage) -> Self {
        let shown = page.documents.len() as i64;
        let next = page.offset + shown;
        Self {
            rows: page.documents.iter().map(DocumentRow::from).collect(),
            total: page.total,
            first: if shown == 0 { 0 } else { page.offset + 1 },
            last: next,
            prev_offset: (page.offset > 0).then(|| (page.offset - page.limit).max(0)),
            next_offset: (next < page.total).then_some(next),
            outcomes: vec![],
            error: None,
            max_file_size_mb: config.upload.max_file_size_mb,
            max_files: config.upload.max_files_per_upload,
            accept: config
                .upload
                .allowed_file_types
                .iter()
                .map(|ext| format!(".{ext}"))
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

async fn library(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Html<String>, UiError> {
    let page = document_page(state.db(), &params).await?;
    render(LibraryTemplate::new(&state.config, page))
}

async fn upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Html<String>, UiError> {
    let result = match read_uploads(multipart, &state.config.upload).await {
        Ok(files) => state.ingestor.ingest_batch(files).await,
        Err(err) => Err(err),
    };

    let page = document_page(state.db(), &PageParams::default()).await?;
    let mut template = LibraryTemplate::new(&state.config, page);
    match result {
        Ok(outcomes) => template.outcomes = outcomes.iter().map(OutcomeRow::from).collect(),
        Err(AppError::Validation(message)) => template.error = Some(message),
        Err(err) => return Err(err.into()),
    }
    render(template)
}

#[derive(Template)]
#[template(path = "document.html")]
struct DocumentTemplate {
    doc: DocumentRow,
    chunk_count: i64,
    total_characters: i64,
    vectors: String,
}

impl DocumentTemplate {
    fn new(doc: &Document, stats: &DocumentStats) -> Self {
        Self {
            doc: DocumentRow::from(doc),
            chunk_count: stats.chunk_count,
            total_characters: stats.total_characters,
            vectors: match stats.vector_count {
                Some(count) => count.to_string(),
                None => "unavailable".to_string(),
            },
        }
    }
}

async fn document_detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Html<String>, UiError> {
    let doc = state.db().get_document(id).await?;
    let stats = state.ingestor.document_stats(id).await?;
    render(DocumentTemplate::new(&doc, &stats))
}

async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Redirect, UiError> {
    state.ingestor.delete_document(id).await?;
    Ok(Redirect::to("/documents"))
}

struct HistoryRow {
    question: String,
    answer: String,
    answered: bool,
    confidence: String,
    sources: String,
    asked: String,
    response_time: String,
}

impl From<&QueryRecord> for HistoryRow {
    fn from(record: &QueryRecord) -> Self {
        // each file once, in rank order
        let mut files: Vec<&str> = Vec::new();
        for source in &record.sources {
            if !files.contains(&source.filename.as_str()) {
                files.push(source.filename.as_str());
            }
        }
        Self {
            question: record.question.clone(),
            answer: record.answer.clone(),
            answered: record.outcome == AnswerOutcome::Answered,
            confidence: format!("{:.0}%", record.confidence * 100.0),
            sources: files.join(", "),
            asked: format_time(&record.created_at),
            response_time: format!("{} ms", record.response_time_ms),
        }
    }
}

#[derive(Template)]
#[template(path = "history.html")]
struct HistoryTemplate {
    rows: Vec<HistoryRow>,
}

async fn history(State(state): State<AppState>) -> Result<Html<String>, UiError> {
    let records = state.db().list_query_records(HISTORY_PAGE_SIZE).await?;
    render(HistoryTemplate {
        rows: records.iter().map(HistoryRow::from).collect(),
    })
}

struct SettingRow {
    name: &'static str,
    value: String,
}

#[derive(Template)]
#[template(path = "settings.html")]
struct SettingsTemplate {
    sections: Vec<(&'static str, Vec<SettingRow>)>,
}

fn setting(name: &'static str, value: impl ToString) -> SettingRow {
    SettingRow {
        name,
        value: value.to_string(),
    }
}

/// Effective settings without credentials.
fn settings_sections(config: &AppConfig) -> Vec<(&'static str, Vec<SettingRow>)> {
    vec![
        (
            "Models",
            vec![
                setting("Base URL", &config.models.base_url),
                setting("Answer model", &config.models.answer_model),
                setting("Embedding model", &config.models.embedding_model),
                setting("Embedding batch size", config.models.embedding_batch_size),
                setting("Max answer tokens", config.models.max_answer_tokens),
                setting("Temperature", config.models.temperature),
            ],
        ),
        (
            "Vector database",
            vec![
                setting("URL", &config.vector.url),
                setting("Collection", &config.vector.collection),
                setting(
                    "API key",
                    if config.vector.api_key.is_some() { "set" } else { "not set" },
                ),
            ],
        ),
        (
            "Chunking",
            vec![
                setting("Chunk size", config.chunking.chunk_size),
                setting("Chunk overlap", config.chunking.chunk_overlap),
                setting("Boundary window", config.chunking.boundary_window),
            ],
        ),
        (
            "Retrieval",
            vec![
                setting("Top k", config.retrieval.top_k),
                setting("Confidence threshold", config.retrieval.confidence_threshold),
                setting("Confidence formula", config.retrieval.confidence_formula.as_str()),
            ],
        ),
        (
            "Uploads",
            vec![
                setting("Max file size", format!("{} MB", config.upload.max_file_size_mb)),
                setting("Allowed file types", config.upload.allowed_file_types.join(", ")),
                setting("Max files per upload", config.upload.max_files_per_upload),
            ],
        ),
        (
            "HTTP",
            vec![
                setting("Timeout", format!("{} s", config.http.timeout.as_secs())),
                setting("Max retries", config.http.max_retries),
                setting(
                    "Retry base delay",
                    format!("{} ms", config.http.retry_base_delay.as_millis()),
                ),
                setting("Concurrent generations", config.http.max_concurrent_generations),
            ],
        ),
    ]
}

async fn settings(State(state): State<AppState>) -> Result<Html<String>, UiError> {
    render(SettingsTemplate {
        sections: settings_sections(&state.config),
    })
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorTemplate {
    status: u16,
    reason: String,
    message: String,
}

/// Failure of a page handler, shown as an HTML error page.
#[derive(Debug)]
pub struct UiError(AppError);

impl From<AppError> for UiError {
    fn from(value: AppError) -> Self {
        Self(value)
    }
}

impl IntoResponse for UiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!("page failed: {}", self.0);
        }
        let page = ErrorTemplate {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.0.to_string(),
        };
        match page.render() {
            Ok(body) => (status, Html(body)).into_response(),
            Err(err) => {
                tracing::error!("error page failed to render: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
            }
        }
    }
}

fn render<T: Template>(template: T) -> Result<Html<String>, UiError> {
    let body = template.render().map_err(AppError::from)?;
    Ok(Html(body))
}

fn format_time(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M UTC").to_string()
}

fn format_bytes(bytes: i64) -> String {
    const KB: f64 = 1024.0;
    let value = bytes as f64;
    if value < KB {
        format!("{bytes} B")
    } else if value < KB * KB {
        format!("{:.1} KB", value / KB)
    } else {
        format!("{:.1} MB", value / (KB * KB))
    }
}
