use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Processing,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Processing => "processing",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "ready" => DocumentStatus::Ready,
            "failed" => DocumentStatus::Failed,
            _ => DocumentStatus::Processing,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub filename: String,
    pub content_hash: String,
    pub file_size: i64,
    pub title: Option<String>,
    pub author: Option<String>,
    pub page_count: i64,
    pub status: DocumentStatus,
    pub status_message: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Row data for a document that has been extracted but not yet indexed.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub filename: String,
    pub content_hash: String,
    pub file_size: i64,
    pub title: Option<String>,
    pub author: Option<String>,
    pub page_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: i64,
    pub ordinal: i64,
    pub content: String,
    pub page: Option<i64>,
    pub start_char: i64,
    pub end_char: i64,
}

impl Chunk {
    /// Stable id for a document's chunk, so re-indexing overwrites rather than
    /// duplicates vectors.
    pub fn derive_id(document_id: i64, ordinal: i64) -> String {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("docqa:{document_id}:{ordinal}").as_bytes(),
        )
        .to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentStats {
    pub document_id: i64,
    pub filename: String,
    pub status: DocumentStatus,
    pub chunk_count: i64,
    pub page_count: i64,
    pub file_size: i64,
    pub total_characters: i64,
    pub uploaded_at: DateTime<Utc>,
    /// Vectors the index reports for this document; `None` when the index
    /// could not be reached.
    pub vector_count: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunk: Chunk,
    pub filename: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceAttribution {
    pub source_id: usize,
    pub chunk_id: String,
    pub document_id: i64,
    pub filename: String,
    pub page: Option<i64>,
    pub ordinal: i64,
    pub score: f32,
    pub snippet: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnswerOutcome {
    Answered,
    NoContext,
}

impl AnswerOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AnswerOutcome::Answered => "answered",
            AnswerOutcome::NoContext => "no_context",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "answered" => AnswerOutcome::Answered,
            _ => AnswerOutcome::NoContext,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub query_id: Option<i64>,
    pub question: String,
    pub answer: String,
    pub outcome: AnswerOutcome,
    pub confidence: f32,
    pub sources: Vec<SourceAttribution>,
    pub retrieved_chunks: usize,
    pub response_time_ms: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: i64,
    pub question: String,
    pub answer: String,
    pub outcome: AnswerOutcome,
    pub confidence: f32,
    pub sources: Vec<SourceAttribution>,
    pub retrieved_chunks: i64,
    pub response_time_ms: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewQueryRecord {
    pub question: String,
    pub answer: String,
    pub outcome: AnswerOutcome,
    pub confidence: f32,
    pub sources: Vec<SourceAttribution>,
    pub retrieved_chunks: i64,
    pub response_time_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub confidence_threshold: Option<f32>,
    #[serde(default)]
    pub document_ids: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(alias = "query")]
    pub q: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub confidence_threshold: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: i64,
    pub filename: String,
    pub ordinal: i64,
    pub page: Option<i64>,
    pub score: f32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchHit>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Indexed,
    Duplicate,
    Rejected,
    Failed,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Indexed => "indexed",
            UploadStatus::Duplicate => "duplicate",
            UploadStatus::Rejected => "rejected",
            UploadStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub filename: String,
    pub status: UploadStatus,
    pub document_id: Option<i64>,
    pub chunk_count: usize,
    pub message: Option<String>,
}

/// One uploaded file as received from the UI, the API or the CLI.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub results: Vec<UploadOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentPage {
    pub documents: Vec<Document>,
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub document_id: i64,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub name: String,
    pub reachable: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub dependencies: Vec<DependencyStatus>,
}
