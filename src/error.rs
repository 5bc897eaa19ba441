use std::fmt;

use thiserror::Error;

/// Hosted dependency that produced a [`AppError::Service`] failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Embedding,
    VectorIndex,
    LanguageModel,
}

impl Service {
    pub fn as_str(self) -> &'static str {
        match self {
            Service::Embedding => "embedding",
            Service::VectorIndex => "vector_index",
            Service::LanguageModel => "language_model",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("document already exists (id {existing_id})")]
    DuplicateDocument { existing_id: i64 },

    #[error("pdf extraction failed: {0}")]
    Extraction(String),

    #[error("{service} service error: {message}")]
    Service {
        service: Service,
        transient: bool,
        message: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("template error: {0}")]
    Template(#[from] askama::Error),
}

impl AppError {
    pub fn service(service: Service, transient: bool, message: impl Into<String>) -> Self {
        AppError::Service {
            service,
            transient,
            message: message.into(),
        }
    }

    /// Whether retrying the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Service { transient: true, .. })
    }

    /// Maps a transport-level reqwest failure. Timeouts and connection
    /// failures are transient; anything else (bad body, redirect loop) is not.
    pub fn from_reqwest(service: Service, err: reqwest::Error) -> Self {
        let transient = err.is_timeout() || err.is_connect() || err.is_request();
        AppError::service(service, transient, err.to_string())
    }

    /// Maps a non-success HTTP status returned by a hosted service.
    pub fn from_status(service: Service, status: reqwest::StatusCode, body: &str) -> Self {
        let transient = status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
        AppError::service(
            service,
            transient,
            format!("{} returned {status}: {}", service, normalize_err_body(body)),
        )
    }
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;

pub(crate) fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(err) = json.get("error") {
            if let Some(message) = err.as_str() {
                return message.to_string();
            }
            if let Some(message) = err.get("message").and_then(|v| v.as_str()) {
                return message.to_string();
            }
        }
        if let Some(status) = json
            .get("status")
            .and_then(|s| s.get("error"))
            .and_then(|v| v.as_str())
        {
            return status.to_string();
        }
    }

    trimmed.chars().take(500).collect()
}
