//! In-memory stand-ins for the hosted services, used by unit tests.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{FromRequest, Multipart};
use axum::http::header::CONTENT_TYPE;
use axum::http::Request;
use tokio::sync::Semaphore;

use crate::answer::AnswerEngine;
use crate::config::AppConfig;
use crate::db::Database;
use crate::error::{AppError, Result, Service};
use crate::ingest::Ingestor;
use crate::models::{Chunk, NewDocument};
use crate::retrieval::Retriever;
use crate::server::AppState;
use crate::traits::{
    Embedder, IndexedVector, LanguageModel, Prompt, VectorHit, VectorIndex, VectorQuery,
};

const STOP_WORDS: [&str; 16] = [
    "a", "an", "and", "are", "does", "for", "how", "is", "of", "on", "the", "to", "what",
    "when", "who", "why",
];

pub fn test_config(extra: &[(&str, &str)]) -> AppConfig {
    let mut vars: HashMap<String, String> = HashMap::new();
    vars.insert("OPENAI_API_KEY".to_string(), "sk-test".to_string());
    for (key, value) in extra {
        vars.insert(key.to_string(), value.to_string());
    }
    AppConfig::from_lookup(|key| vars.get(key).cloned()).unwrap()
}

/// Application state wired to in-memory services, with handles to inspect them.
pub struct TestApp {
    pub state: AppState,
    pub db: Database,
    pub index: Arc<InMemoryIndex>,
    pub model: Arc<ScriptedModel>,
}

pub async fn test_app(reply: &str, extra: &[(&str, &str)]) -> TestApp {
    let config = test_config(extra);
    let db = Database::in_memory().await.unwrap();
    let index = Arc::new(InMemoryIndex::default());
    let model = Arc::new(ScriptedModel::new(reply));
    let retriever = Retriever::new(db.clone(), Arc::new(HashingEmbedder::default()), index.clone());
    let ingestor = Ingestor::new(config.chunking, config.upload.clone(), retriever.clone());
    let engine = AnswerEngine::new(
        retriever,
        model.clone(),
        config.retrieval,
        Arc::new(Semaphore::new(config.http.max_concurrent_generations)),
    );
    TestApp {
        state: AppState::new(config, ingestor, engine),
        db,
        index,
        model,
    }
}

/// Builds the multipart body a browser sends for a form with `file` inputs.
pub async fn multipart_upload(files: &[(&str, &[u8])]) -> Multipart {
    let boundary = "docqa-test-boundary";
    let mut body = Vec::new();
    for (name, bytes) in files {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\nContent-Type: application/pdf\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    let request = Request::builder()
        .method("POST")
        .uri("/api/documents")
        .header(CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
        .body(Body::from(body))
        .unwrap();
    Multipart::from_request(request, &()).await.unwrap()
}

/// Stores a ready document with one chunk per text and indexes its vectors.
pub async fn seed_document(retriever: &Retriever, name: &str, texts: &[&str]) -> Vec<Chunk> {
    let doc = retriever
        .db()
        .reserve_document(&NewDocument {
            filename: name.to_string(),
            content_hash: format!("hash-{name}"),
            file_size: 100,
            title: None,
            author: None,
            page_count: 1,
        })
        .await
        .unwrap();

    let mut offset = 0;
    let chunks: Vec<Chunk> = texts
        .iter()
        .enumerate()
        .map(|(ordinal, text)| {
            let len = text.chars().count() as i64;
            let chunk = Chunk {
                id: Chunk::derive_id(doc.id, ordinal as i64),
                document_id: doc.id,
                ordinal: ordinal as i64,
                content: text.to_string(),
                page: Some(1),
                start_char: offset,
                end_char: offset + len,
            };
            offset += len;
            chunk
        })
        .collect();

    retriever.index_chunks(&chunks).await.unwrap();
    retriever
        .db()
        .complete_document(doc.id, &chunks)
        .await
        .unwrap();
    chunks
}

/// Bag-of-words embedder: every non stop-word token is hashed into a bucket,
/// the vector is L2 normalized. Texts sharing words score higher.
pub struct HashingEmbedder {
    dimensions: usize,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            dimensions: 512,
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }
}

impl HashingEmbedder {
    pub fn fail_next(&self, fail: bool) {
        self.fail.store(fail, AtomicOrdering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(AtomicOrdering::SeqCst)
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];
        let lowered = text.to_lowercase();
        let tokens = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty() && !STOP_WORDS.contains(token));

        for token in tokens {
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            vector[(hash % self.dimensions as u64) as usize] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        if self.fail.load(AtomicOrdering::SeqCst) {
            return Err(AppError::service(
                Service::Embedding,
                true,
                "embedding service unavailable",
            ));
        }
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryIndex {
    points: Mutex<HashMap<String, IndexedVector>>,
    fail_upserts: AtomicBool,
    fail_deletes: AtomicBool,
    unreachable: AtomicBool,
    upsert_calls: AtomicUsize,
}

impl InMemoryIndex {
    pub fn len(&self) -> usize {
        self.points.lock().unwrap().len()
    }

    pub fn ids_for(&self, document_id: i64) -> Vec<String> {
        let mut ids: Vec<String> = self
            .points
            .lock()
            .unwrap()
            .values()
            .filter(|point| point.payload.document_id == document_id)
            .map(|point| point.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(AtomicOrdering::SeqCst)
    }

    pub fn fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, AtomicOrdering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, AtomicOrdering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, AtomicOrdering::SeqCst);
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(&self, points: &[IndexedVector]) -> Result<()> {
        self.upsert_calls.fetch_add(1, AtomicOrdering::SeqCst);
        if self.fail_upserts.load(AtomicOrdering::SeqCst) {
            return Err(AppError::service(
                Service::VectorIndex,
                false,
                "vector index rejected the upsert",
            ));
        }
        let mut stored = self.points.lock().unwrap();
        for point in points {
            stored.insert(point.id.clone(), point.clone());
        }
        Ok(())
    }

    async fn query(&self, vector: &[f32], query: &VectorQuery) -> Result<Vec<VectorHit>> {
        let stored = self.points.lock().unwrap();
        let mut hits: Vec<VectorHit> = stored
            .values()
            .filter(|point| match &query.document_ids {
                Some(ids) if !ids.is_empty() => ids.contains(&point.payload.document_id),
                _ => true,
            })
            .map(|point| VectorHit {
                chunk_id: point.id.clone(),
                document_id: point.payload.document_id,
                score: cosine(vector, &point.vector),
            })
            .filter(|hit| query.score_floor.map_or(true, |floor| hit.score >= floor))
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits.truncate(query.top_k);
        Ok(hits)
    }

    async fn delete_document(&self, document_id: i64) -> Result<()> {
        if self.fail_deletes.load(AtomicOrdering::SeqCst) {
            return Err(AppError::service(
                Service::VectorIndex,
                true,
                "vector index unavailable",
            ));
        }
        self.points
            .lock()
            .unwrap()
            .retain(|_, point| point.payload.document_id != document_id);
        Ok(())
    }

    async fn count_document(&self, document_id: i64) -> Result<u64> {
        Ok(self.ids_for(document_id).len() as u64)
    }

    async fn health(&self) -> Result<()> {
        if self.unreachable.load(AtomicOrdering::SeqCst) {
            return Err(AppError::service(
                Service::VectorIndex,
                true,
                "connection refused",
            ));
        }
        Ok(())
    }
}

/// Language model that replies with a fixed answer and records prompts.
pub struct ScriptedModel {
    reply: String,
    fail: AtomicBool,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedModel {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            fail: AtomicBool::new(false),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        let model = Self::new("");
        model.fail.store(true, AtomicOrdering::SeqCst);
        model
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, prompt: &Prompt) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.clone());
        if self.fail.load(AtomicOrdering::SeqCst) {
            return Err(AppError::service(
                Service::LanguageModel,
                true,
                "request timed out",
            ));
        }
        Ok(self.reply.clone())
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ChunkPayload;

    fn point(document_id: i64, ordinal: i64, vector: Vec<f32>) -> IndexedVector {
        let id = Chunk::derive_id(document_id, ordinal);
        IndexedVector {
            id: id.clone(),
            vector,
            payload: ChunkPayload {
                chunk_id: id,
                document_id,
                ordinal,
                page: None,
                text: format!("chunk {ordinal}"),
            },
        }
    }

    #[tokio::test]
    async fn upserting_the_same_ids_twice_keeps_one_copy() {
        let index = InMemoryIndex::default();
        let points: Vec<IndexedVector> = (0..3).map(|n| point(1, n, vec![1.0, 0.0])).collect();

        index.upsert(&points).await.unwrap();
        index.upsert(&points).await.unwrap();

        assert_eq!(index.len(), 3);
        assert_eq!(index.count_document(1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn deleting_a_document_removes_only_its_vectors() {
        let index = InMemoryIndex::default();
        let seven: Vec<IndexedVector> = (0..12).map(|n| point(7, n, vec![0.0, 1.0])).collect();
        let other: Vec<IndexedVector> = (0..2).map(|n| point(8, n, vec![0.0, 1.0])).collect();
        index.upsert(&seven).await.unwrap();
        index.upsert(&other).await.unwrap();

        index.delete_document(7).await.unwrap();

        assert_eq!(index.count_document(7).await.unwrap(), 0);
        assert_eq!(index.count_document(8).await.unwrap(), 2);
    }

    #[test]
    fn shared_words_raise_similarity() {
        let embedder = HashingEmbedder::default();
        let question = embedder.embed_one("What is the refund policy?");
        let related = embedder.embed_one("Refund policy: refunds within 30 days.");
        let unrelated = embedder.embed_one("Shipping is free.");

        assert!(cosine(&question, &related) > 0.3);
        assert!(cosine(&question, &unrelated) < 0.3);
    }
}
