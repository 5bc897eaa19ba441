use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;

use crate::error::{AppError, Result};

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub api_key: String,
    pub base_url: String,
    pub answer_model: String,
    pub embedding_model: String,
    pub embedding_batch_size: usize,
    pub max_answer_tokens: usize,
    pub temperature: f32,
}

#[derive(Clone, Debug)]
pub struct VectorConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub collection: String,
}

#[derive(Clone, Copy, Debug)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub boundary_window: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_024,
            chunk_overlap: 200,
            boundary_window: 200,
        }
    }
}

/// How retrieval similarity scores become the reported answer confidence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfidenceFormula {
    /// Mean similarity of the chunks used as context.
    Mean,
    /// Similarity of the best chunk.
    Max,
    /// 0.7 * best similarity + 0.3 * share of the top-k budget that was filled.
    Weighted,
}

impl ConfidenceFormula {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfidenceFormula::Mean => "mean",
            ConfidenceFormula::Max => "max",
            ConfidenceFormula::Weighted => "weighted",
        }
    }
}

impl FromStr for ConfidenceFormula {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mean" | "average" => Ok(ConfidenceFormula::Mean),
            "max" => Ok(ConfidenceFormula::Max),
            "weighted" => Ok(ConfidenceFormula::Weighted),
            other => Err(AppError::Config(format!(
                "unknown CONFIDENCE_FORMULA '{other}' (expected mean, max or weighted)"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub confidence_threshold: f32,
    pub confidence_formula: ConfidenceFormula,
}

#[derive(Clone, Debug)]
pub struct UploadConfig {
    pub max_file_size_mb: u64,
    pub allowed_file_types: Vec<String>,
    pub max_files_per_upload: usize,
}

impl UploadConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    pub fn is_allowed_extension(&self, filename: &str) -> bool {
        let Some((_, ext)) = filename.rsplit_once('.') else {
            return false;
        };
        self.allowed_file_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(ext))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub max_concurrent_generations: usize,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub database_url: String,
    pub models: ModelConfig,
    pub vector: VectorConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub upload: UploadConfig,
    pub http: HttpConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Missing
    /// credentials and malformed values are reported here so the process
    /// never starts half-configured.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let data_dir = get("DOCQA_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));
        let database_url = get("DATABASE_URL").unwrap_or_else(|| {
            format!("sqlite://{}", data_dir.join("docqa.sqlite3").display())
        });

        let api_key = get("OPENAI_API_KEY")
            .ok_or_else(|| AppError::Config("OPENAI_API_KEY must be set".to_string()))?;

        let qdrant_url = get("QDRANT_URL").unwrap_or_else(|| "http://127.0.0.1:6333".to_string());
        let qdrant_api_key = get("QDRANT_API_KEY");
        if qdrant_api_key.is_none() && !is_loopback_url(&qdrant_url)? {
            return Err(AppError::Config(format!(
                "QDRANT_API_KEY must be set for hosted vector database {qdrant_url}"
            )));
        }

        let models = ModelConfig {
            api_key,
            base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            answer_model: get("ANSWER_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            embedding_model: get("EMBEDDING_MODEL")
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            embedding_batch_size: parse_or(&get, "EMBEDDING_BATCH_SIZE", 64)?,
            max_answer_tokens: parse_or(&get, "ANSWER_MAX_TOKENS", 1_500)?,
            temperature: parse_or(&get, "ANSWER_TEMPERATURE", 0.1)?,
        };

        let vector = VectorConfig {
            url: qdrant_url.trim_end_matches('/').to_string(),
            api_key: qdrant_api_key,
            collection: get("QDRANT_COLLECTION").unwrap_or_else(|| "docqa_chunks".to_string()),
        };

        let defaults = ChunkingConfig::default();
        let chunking = ChunkingConfig {
            chunk_size: parse_or(&get, "CHUNK_SIZE", defaults.chunk_size)?,
            chunk_overlap: parse_or(&get, "CHUNK_OVERLAP", defaults.chunk_overlap)?,
            boundary_window: parse_or(&get, "CHUNK_BOUNDARY_WINDOW", defaults.boundary_window)?,
        };

        let retrieval = RetrievalConfig {
            top_k: parse_or(&get, "SIMILARITY_TOP_K", 5)?,
            confidence_threshold: parse_or(&get, "CONFIDENCE_THRESHOLD", 0.7)?,
            confidence_formula: match get("CONFIDENCE_FORMULA") {
                Some(raw) => raw.parse()?,
                None => ConfidenceFormula::Mean,
            },
        };

        let upload = UploadConfig {
            max_file_size_mb: parse_or(&get, "MAX_FILE_SIZE_MB", 50)?,
            allowed_file_types: get("ALLOWED_FILE_TYPES")
                .map(|raw| {
                    raw.split(',')
                        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                        .filter(|ext| !ext.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| vec!["pdf".to_string()]),
            max_files_per_upload: parse_or(&get, "MAX_FILES_PER_UPLOAD", 100)?,
        };

        let http = HttpConfig {
            timeout: Duration::from_secs(parse_or(&get, "HTTP_TIMEOUT_SECS", 60)?),
            max_retries: parse_or(&get, "HTTP_MAX_RETRIES", 2)?,
            retry_base_delay: Duration::from_millis(parse_or(&get, "HTTP_RETRY_BASE_MS", 250)?),
            max_concurrent_generations: parse_or(&get, "MAX_CONCURRENT_GENERATIONS", 4)?,
        };

        let config = Self {
            bind_addr: get("DOCQA_BIND").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            data_dir,
            database_url,
            models,
            vector,
            chunking,
            retrieval,
            upload,
            http,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 || self.chunking.chunk_size <= self.chunking.chunk_overlap {
            return Err(AppError::Config(format!(
                "CHUNK_SIZE ({}) must be greater than CHUNK_OVERLAP ({})",
                self.chunking.chunk_size, self.chunking.chunk_overlap
            )));
        }
        if self.retrieval.top_k == 0 {
            return Err(AppError::Config("SIMILARITY_TOP_K must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.retrieval.confidence_threshold) {
            return Err(AppError::Config(
                "CONFIDENCE_THRESHOLD must be between 0 and 1".to_string(),
            ));
        }
        if self.upload.allowed_file_types.is_empty() {
            return Err(AppError::Config("ALLOWED_FILE_TYPES is empty".to_string()));
        }
        if self.upload.max_files_per_upload == 0 || self.upload.max_file_size_mb == 0 {
            return Err(AppError::Config(
                "upload limits must be greater than zero".to_string(),
            ));
        }
        if self.models.embedding_batch_size == 0 || self.http.max_concurrent_generations == 0 {
            return Err(AppError::Config(
                "EMBEDDING_BATCH_SIZE and MAX_CONCURRENT_GENERATIONS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Upper bound for one multipart upload request body.
    pub fn max_request_bytes(&self) -> usize {
        let per_file = self.upload.max_file_size_bytes() as usize;
        per_file
            .saturating_mul(self.upload.max_files_per_upload)
            .saturating_add(1024 * 1024)
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| AppError::Config(format!("{key} has invalid value '{raw}'"))),
        None => Ok(default),
    }
}

fn is_loopback_url(raw: &str) -> Result<bool> {
    let url = Url::parse(raw)
        .map_err(|err| AppError::Config(format!("QDRANT_URL '{raw}' is not a valid URL: {err}")))?;
    Ok(matches!(
        url.host_str(),
        Some("localhost") | Some("127.0.0.1") | Some("[::1]") | Some("::1")
    ))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_credentials_are_set() {
        let config = config_from(&[("OPENAI_API_KEY", "sk-test")]).unwrap();
        assert_eq!(config.chunking.chunk_size, 1024);
        assert_eq!(config.chunking.chunk_overlap, 200);
        assert_eq!(config.retrieval.top_k, 5);
        assert!((config.retrieval.confidence_threshold - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.retrieval.confidence_formula, ConfidenceFormula::Mean);
        assert_eq!(config.upload.allowed_file_types, vec!["pdf".to_string()]);
        assert_eq!(config.vector.collection, "docqa_chunks");
        assert!(config.database_url.starts_with("sqlite://"));
    }

    #[test]
    fn missing_llm_key_prevents_startup() {
        let err = config_from(&[]).unwrap_err();
        assert!(matches!(err, AppError::Config(msg) if msg.contains("OPENAI_API_KEY")));
    }

    #[test]
    fn hosted_qdrant_requires_api_key() {
        let err = config_from(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("QDRANT_URL", "https://abc.cloud.qdrant.io:6333"),
        ])
        .unwrap_err();
        assert!(matches!(err, AppError::Config(msg) if msg.contains("QDRANT_API_KEY")));

        let ok = config_from(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("QDRANT_URL", "https://abc.cloud.qdrant.io:6333/"),
            ("QDRANT_API_KEY", "qk"),
        ])
        .unwrap();
        assert_eq!(ok.vector.url, "https://abc.cloud.qdrant.io:6333");
    }

    #[test]
    fn chunk_overlap_must_be_smaller_than_size() {
        let err = config_from(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("CHUNK_SIZE", "200"),
            ("CHUNK_OVERLAP", "200"),
        ])
        .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = config_from(&[("OPENAI_API_KEY", "sk-test"), ("SIMILARITY_TOP_K", "five")])
            .unwrap_err();
        assert!(matches!(err, AppError::Config(msg) if msg.contains("SIMILARITY_TOP_K")));
    }

    #[test]
    fn allowed_types_are_normalized() {
        let config = config_from(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("ALLOWED_FILE_TYPES", " .PDF, pdf ,"),
            ("CONFIDENCE_FORMULA", "weighted"),
        ])
        .unwrap();
        assert!(config.upload.is_allowed_extension("report.Pdf"));
        assert!(!config.upload.is_allowed_extension("report.docx"));
        assert!(!config.upload.is_allowed_extension("README"));
        assert_eq!(config.retrieval.confidence_formula, ConfidenceFormula::Weighted);
    }
}
