use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Turns text into embedding vectors, one per input, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn health(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> Result<String>;

    async fn health(&self) -> Result<()>;
}

/// Metadata stored next to each vector in the index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkPayload {
    pub chunk_id: String,
    pub document_id: i64,
    pub ordinal: i64,
    pub page: Option<i64>,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct IndexedVector {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: ChunkPayload,
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub document_id: i64,
    pub score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct VectorQuery {
    pub top_k: usize,
    pub score_floor: Option<f32>,
    pub document_ids: Option<Vec<i64>>,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Re-upserting an id replaces its vector and payload.
    async fn upsert(&self, points: &[IndexedVector]) -> Result<()>;

    async fn query(&self, vector: &[f32], query: &VectorQuery) -> Result<Vec<VectorHit>>;

    async fn delete_document(&self, document_id: i64) -> Result<()>;

    async fn count_document(&self, document_id: i64) -> Result<u64>;

    async fn health(&self) -> Result<()>;
}
