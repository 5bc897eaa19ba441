pub mod chunker;
pub mod pdf;

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::config::{ChunkingConfig, UploadConfig};
use crate::error::{AppError, Result};
use crate::models::{
    Chunk, Document, DocumentStats, NewDocument, UploadOutcome, UploadStatus, UploadedFile,
};
use crate::retrieval::Retriever;

const PDF_CONTENT_TYPES: [&str; 3] = ["application/pdf", "application/x-pdf", "application/octet-stream"];

#[derive(Clone)]
pub struct Ingestor {
    chunking: ChunkingConfig,
    upload: UploadConfig,
    retriever: Retriever,
}

#[derive(Debug, Clone)]
pub struct IngestedDocument {
    pub document: Document,
    pub chunk_count: usize,
}

impl Ingestor {
    pub fn new(chunking: ChunkingConfig, upload: UploadConfig, retriever: Retriever) -> Self {
        Self {
            chunking,
            upload,
            retriever,
        }
    }

    /// Processes every file independently; one bad file never aborts the
    /// rest. Only an oversized batch is rejected as a whole.
    pub async fn ingest_batch(&self, files: Vec<UploadedFile>) -> Result<Vec<UploadOutcome>> {
        if files.is_empty() {
            return Err(AppError::Validation("no files were uploaded".to_string()));
        }
        if files.len() > self.upload.max_files_per_upload {
            return Err(AppError::Validation(format!(
                "{} files uploaded, at most {} allowed per upload",
                files.len(),
                self.upload.max_files_per_upload
            )));
        }

        let mut outcomes = Vec::with_capacity(files.len());
        for file in files {
            let filename = file.filename.clone();
            let outcome = match self.ingest_file(file).await {
                Ok(ingested) => UploadOutcome {
                    filename,
                    status: UploadStatus::Indexed,
                    document_id: Some(ingested.document.id),
                    chunk_count: ingested.chunk_count,
                    message: None,
                },
                Err(err) => outcome_for_error(filename, err),
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    pub async fn ingest_file(&self, file: UploadedFile) -> Result<IngestedDocument> {
        let filename = sanitize_filename(&file.filename);
        validate_upload(&self.upload, &filename, &file)?;

        let db = self.retriever.db();
        let content_hash = content_sha256(&file.bytes);
        if let Some(existing) = db.find_live_document_by_hash(&content_hash).await? {
            tracing::info!(
                "skipping {}: same content as document {}",
                filename,
                existing.id
            );
            return Err(AppError::DuplicateDocument {
                existing_id: existing.id,
            });
        }

        let file_size = file.bytes.len() as i64;
        let bytes = file.bytes;
        let extracted = tokio::task::spawn_blocking(move || pdf::extract_pdf(&bytes))
            .await
            .map_err(|err| AppError::Extraction(format!("extraction task failed: {err}")))??;

        let spans = chunker::chunk_text(&extracted.full_text, &self.chunking)?;
        if spans.is_empty() {
            return Err(AppError::Extraction(
                "PDF contains no extractable text".to_string(),
            ));
        }

        let document = db
            .reserve_document(&NewDocument {
                filename: filename.clone(),
                content_hash,
                file_size,
                title: extracted.metadata.title.clone(),
                author: extracted.metadata.author.clone(),
                page_count: i64::from(extracted.metadata.page_count),
            })
            .await?;

        let chunks: Vec<Chunk> = spans
            .into_iter()
            .map(|span| Chunk {
                id: Chunk::derive_id(document.id, span.ordinal as i64),
                document_id: document.id,
                ordinal: span.ordinal as i64,
                page: extracted.page_at(span.start).map(i64::from),
                start_char: span.start as i64,
                end_char: span.end as i64,
                content: span.text,
            })
            .collect();

        tracing::info!(
            "document {} ({}): {} pages, {} chunks",
            document.id,
            filename,
            extracted.metadata.page_count,
            chunks.len()
        );

        let indexed = match self.retriever.index_chunks(&chunks).await {
            Ok(_) => db.complete_document(document.id, &chunks).await,
            Err(err) => Err(err),
        };

        if let Err(err) = indexed {
            self.abandon(document.id, &err).await;
            return Err(err);
        }

        Ok(IngestedDocument {
            document: db.get_document(document.id).await?,
            chunk_count: chunks.len(),
        })
    }

    /// Deletes the document's vectors, then its rows. When the index cannot
    /// be reached the database is left untouched so the delete can be retried.
    pub async fn delete_document(&self, document_id: i64) -> Result<()> {
        let document = self.retriever.db().get_document(document_id).await?;
        self.retriever.remove_document(document.id).await?;
        self.retriever.db().delete_document(document.id).await?;
        tracing::info!("document {} ({}) removed", document.id, document.filename);
        Ok(())
    }

    pub async fn document_stats(&self, document_id: i64) -> Result<DocumentStats> {
        let mut stats = self.retriever.db().document_stats(document_id).await?;
        stats.vector_count = match self.retriever.count_vectors(document_id).await {
            Ok(count) => Some(count),
            Err(err) => {
                tracing::warn!("vector count for document {} unavailable: {}", document_id, err);
                None
            }
        };
        Ok(stats)
    }

    /// Fails documents left `processing` by an earlier run that stopped
    /// mid-ingest and drops their vectors, so their files can be uploaded
    /// again. Call once at start-up, before any ingest runs.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let ids = self
            .retriever
            .db()
            .fail_interrupted_documents("interrupted before indexing finished")
            .await?;
        for id in &ids {
            tracing::warn!("document {} was left processing, marked failed", id);
            if let Err(err) = self.retriever.remove_document(*id).await {
                tracing::warn!(
                    "could not remove vectors of interrupted document {}: {}",
                    id,
                    err
                );
            }
        }
        Ok(ids.len())
    }

    /// Removes whatever was written for a document whose indexing failed and
    /// marks it failed, so no partially indexed document stays visible.
    async fn abandon(&self, document_id: i64, cause: &AppError) {
        tracing::error!("indexing document {} failed: {}", document_id, cause);

        if let Err(err) = self.retriever.remove_document(document_id).await {
            tracing::warn!(
                "could not remove vectors of failed document {}: {}",
                document_id,
                err
            );
        }
        if let Err(err) = self
            .retriever
            .db()
            .fail_document(document_id, &cause.to_string())
            .await
        {
            tracing::warn!("could not mark document {} failed: {}", document_id, err);
        }
    }
}

fn outcome_for_error(filename: String, err: AppError) -> UploadOutcome {
    let (status, document_id) = match &err {
        AppError::DuplicateDocument { existing_id } => (UploadStatus::Duplicate, Some(*existing_id)),
        AppError::Validation(_) => (UploadStatus::Rejected, None),
        _ => (UploadStatus::Failed, None),
    };
    if status == UploadStatus::Failed {
        tracing::warn!("upload of {} failed: {}", filename, err);
    }
    UploadOutcome {
        filename,
        status,
        document_id,
        chunk_count: 0,
        message: Some(err.to_string()),
    }
}

pub fn validate_upload(config: &UploadConfig, filename: &str, file: &UploadedFile) -> Result<()> {
    if filename.is_empty() {
        return Err(AppError::Validation("file name is missing".to_string()));
    }
    if !config.is_allowed_extension(filename) {
        return Err(AppError::Validation(format!(
            "{filename}: file type not allowed (allowed: {})",
            config.allowed_file_types.join(", ")
        )));
    }
    if let Some(content_type) = file.content_type.as_deref() {
        let essence = content_type.split(';').next().unwrap_or_default().trim();
        if !PDF_CONTENT_TYPES
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(essence))
        {
            return Err(AppError::Validation(format!(
                "{filename}: unexpected content type {content_type}"
            )));
        }
    }
    if file.bytes.is_empty() {
        return Err(AppError::Validation(format!("{filename}: file is empty")));
    }
    if file.bytes.len() as u64 > config.max_file_size_bytes() {
        return Err(AppError::Validation(format!(
            "{filename}: file exceeds {} MB",
            config.max_file_size_mb
        )));
    }
    if !pdf::looks_like_pdf(&file.bytes) {
        return Err(AppError::Validation(format!(
            "{filename}: file is not a PDF"
        )));
    }
    Ok(())
}

fn sanitize_filename(raw: &str) -> String {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    Path::new(name)
        .file_name()
        .map(|name| name.to_string_lossy().trim().to_string())
        .unwrap_or_default()
}

pub fn content_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
