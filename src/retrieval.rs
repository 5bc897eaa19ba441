use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::db::Database;
use crate::error::{AppError, Result, Service};
use crate::models::{Chunk, RetrievalResult};
use crate::traits::{ChunkPayload, Embedder, IndexedVector, VectorIndex, VectorQuery};

const UPSERT_BATCH_SIZE: usize = 64;

/// Extra hits requested from the index so that hits dropped during
/// hydration (deleted or unfinished documents) do not shrink the result.
const RECALL_FACTOR: usize = 2;

#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    pub top_k: usize,
    pub confidence_threshold: f32,
    pub document_ids: Option<Vec<i64>>,
}

#[derive(Clone)]
pub struct Retriever {
    db: Database,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
}

impl Retriever {
    pub fn new(db: Database, embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            db,
            embedder,
            index,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Embeds the chunks and writes them to the index with their payload.
    /// Point ids are chunk ids, so indexing the same chunk again overwrites it.
    pub async fn index_chunks(&self, chunks: &[Chunk]) -> Result<usize> {
        let mut written = 0;
        for batch in chunks.chunks(UPSERT_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|chunk| chunk.content.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(AppError::service(
                    Service::Embedding,
                    false,
                    format!(
                        "embedder returned {} vectors for {} chunks",
                        vectors.len(),
                        batch.len()
                    ),
                ));
            }

            let points: Vec<IndexedVector> = batch
                .iter()
                .zip(vectors)
                .map(|(chunk, vector)| IndexedVector {
                    id: chunk.id.clone(),
                    vector,
                    payload: ChunkPayload {
                        chunk_id: chunk.id.clone(),
                        document_id: chunk.document_id,
                        ordinal: chunk.ordinal,
                        page: chunk.page,
                        text: chunk.content.clone(),
                    },
                })
                .collect();

            self.index.upsert(&points).await?;
            written += points.len();
            tracing::debug!("upserted {} vectors ({} so far)", points.len(), written);
        }
        Ok(written)
    }

    /// Chunks most similar to `question` scoring at least the threshold,
    /// best first, at most `top_k`.
    pub async fn search(&self, question: &str, params: &SearchParams) -> Result<Vec<RetrievalResult>> {
        if params.top_k == 0 {
            return Ok(vec![]);
        }

        let mut vectors = self.embedder.embed(&[question.to_string()]).await?;
        let Some(vector) = vectors.pop() else {
            return Ok(vec![]);
        };

        let mut hits = self
            .index
            .query(
                &vector,
                &VectorQuery {
                    top_k: params.top_k.saturating_mul(RECALL_FACTOR),
                    score_floor: Some(params.confidence_threshold),
                    document_ids: params.document_ids.clone(),
                },
            )
            .await?;

        hits.retain(|hit| hit.score >= params.confidence_threshold);
        if let Some(ids) = params.document_ids.as_ref().filter(|ids| !ids.is_empty()) {
            hits.retain(|hit| ids.contains(&hit.document_id));
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

        let scores: HashMap<String, f32> = hits
            .iter()
            .map(|hit| (hit.chunk_id.clone(), hit.score))
            .collect();
        let ranked_ids: Vec<String> = hits.into_iter().map(|hit| hit.chunk_id).collect();

        let live = self.db.live_chunks_by_ids(&ranked_ids).await?;
        let dropped = ranked_ids.len() - live.len();
        if dropped > 0 {
            tracing::debug!("dropped {} stale vector hits", dropped);
        }

        let mut results: Vec<RetrievalResult> = live
            .into_iter()
            .map(|(chunk, filename)| RetrievalResult {
                score: scores.get(&chunk.id).copied().unwrap_or(0.0),
                chunk,
                filename,
            })
            .collect();
        results.truncate(params.top_k);
        Ok(results)
    }

    pub async fn remove_document(&self, document_id: i64) -> Result<()> {
        self.index.delete_document(document_id).await
    }

    pub async fn count_vectors(&self, document_id: i64) -> Result<u64> {
        self.index.count_document(document_id).await
    }
}
