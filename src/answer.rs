use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;

use crate::config::{ConfidenceFormula, RetrievalConfig};
use crate::error::{AppError, Result, Service};
use crate::models::{
    Answer, AnswerOutcome, NewQueryRecord, QueryRequest, RetrievalResult, SearchHit,
    SearchRequest, SearchResponse, SourceAttribution,
};
use crate::retrieval::{Retriever, SearchParams};
use crate::traits::{LanguageModel, Prompt};

pub const NO_CONTEXT_MESSAGE: &str = "I could not find information in the uploaded documents that answers this question. Try rephrasing it or upload more documents.";

const SNIPPET_CHARS: usize = 200;

const SYSTEM_PROMPT: &str = "You are an assistant that answers questions about the user's documents.
Rules:
1. Answer only from the provided context.
2. If the context does not contain enough information, say so plainly.
3. Cite sources inline as [Source N] for every fact you use.
4. Answer in the language of the question.
5. Be specific and keep the answer well structured.";

#[derive(Clone)]
pub struct AnswerEngine {
    retriever: Retriever,
    model: Arc<dyn LanguageModel>,
    defaults: RetrievalConfig,
    generation_limit: Arc<Semaphore>,
}

impl AnswerEngine {
    pub fn new(
        retriever: Retriever,
        model: Arc<dyn LanguageModel>,
        defaults: RetrievalConfig,
        generation_limit: Arc<Semaphore>,
    ) -> Self {
        Self {
            retriever,
            model,
            defaults,
            generation_limit,
        }
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    pub async fn answer(&self, request: QueryRequest) -> Result<Answer> {
        let started = Instant::now();
        let question = request.question.trim().to_string();
        if question.is_empty() {
            return Err(AppError::Validation("question must not be empty".to_string()));
        }
        let params = self.resolve_params(
            request.top_k,
            request.confidence_threshold,
            request.document_ids,
        )?;

        let retrieved = self.retriever.search(&question, &params).await?;
        if retrieved.is_empty() {
            tracing::info!(
                "no chunk cleared threshold {:.2} for question",
                params.confidence_threshold
            );
            let mut answer = Answer {
                query_id: None,
                question,
                answer: NO_CONTEXT_MESSAGE.to_string(),
                outcome: AnswerOutcome::NoContext,
                confidence: 0.0,
                sources: vec![],
                retrieved_chunks: 0,
                response_time_ms: started.elapsed().as_millis(),
            };
            answer.query_id = self.record(&answer).await;
            return Ok(answer);
        }

        let prompt = build_prompt(&question, &retrieved);
        let text = {
            let _permit = self.generation_limit.acquire().await.map_err(|_| {
                AppError::service(Service::LanguageModel, true, "generation limiter closed")
            })?;
            self.model.complete(&prompt).await?
        };

        let scores: Vec<f32> = retrieved.iter().map(|result| result.score).collect();
        let mut answer = Answer {
            query_id: None,
            question,
            answer: text,
            outcome: AnswerOutcome::Answered,
            confidence: compute_confidence(self.defaults.confidence_formula, &scores, params.top_k),
            sources: build_sources(&retrieved),
            retrieved_chunks: retrieved.len(),
            response_time_ms: started.elapsed().as_millis(),
        };
        answer.query_id = self.record(&answer).await;

        tracing::info!(
            "answered from {} chunks in {} ms (confidence {:.3})",
            answer.retrieved_chunks,
            answer.response_time_ms,
            answer.confidence
        );
        Ok(answer)
    }

    /// Retrieval only: ranked chunks without calling the language model.
    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        let query = request.q.trim().to_string();
        if query.is_empty() {
            return Err(AppError::Validation("query must not be empty".to_string()));
        }
        let params = self.resolve_params(request.top_k, request.confidence_threshold, None)?;

        let results = self
            .retriever
            .search(&query, &params)
            .await?
            .into_iter()
            .map(|result| SearchHit {
                chunk_id: result.chunk.id,
                document_id: result.chunk.document_id,
                filename: result.filename,
                ordinal: result.chunk.ordinal,
                page: result.chunk.page,
                score: result.score,
                text: result.chunk.content,
            })
            .collect();

        Ok(SearchResponse { query, results })
    }

    fn resolve_params(
        &self,
        top_k: Option<usize>,
        threshold: Option<f32>,
        document_ids: Option<Vec<i64>>,
    ) -> Result<SearchParams> {
        let top_k = top_k.unwrap_or(self.defaults.top_k);
        if top_k == 0 {
            return Err(AppError::Validation("top_k must be at least 1".to_string()));
        }
        let confidence_threshold = threshold.unwrap_or(self.defaults.confidence_threshold);
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(AppError::Validation(
                "confidence_threshold must be between 0 and 1".to_string(),
            ));
        }
        Ok(SearchParams {
            top_k,
            confidence_threshold,
            document_ids: document_ids.filter(|ids| !ids.is_empty()),
        })
    }

    /// Appends the answer to the query history. A history write failure is
    /// logged and the answer is still returned, without an id.
    async fn record(&self, answer: &Answer) -> Option<i64> {
        let record = NewQueryRecord {
            question: answer.question.clone(),
            answer: answer.answer.clone(),
            outcome: answer.outcome,
            confidence: answer.confidence,
            sources: answer.sources.clone(),
            retrieved_chunks: answer.retrieved_chunks as i64,
            response_time_ms: answer.response_time_ms as i64,
        };
        match self.retriever.db().insert_query_record(&record).await {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!("failed to record query history: {}", err);
                None
            }
        }
    }
}

pub fn build_prompt(question: &str, retrieved: &[RetrievalResult]) -> Prompt {
    let context = retrieved
        .iter()
        .enumerate()
        .map(|(idx, result)| {
            format!(
                "[Source {}] (document {}, {}, page {}, chunk {}, relevance {:.3})\n{}\n",
                idx + 1,
                result.chunk.document_id,
                result.filename,
                result
                    .chunk
                    .page
                    .map(|page| page.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                result.chunk.ordinal,
                result.score,
                result.chunk.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user: format!(
            "Context from the documents:\n{context}\nQuestion: {question}\n\nAnswer from the context above and cite your sources."
        ),
    }
}

fn build_sources(retrieved: &[RetrievalResult]) -> Vec<SourceAttribution> {
    retrieved
        .iter()
        .enumerate()
        .map(|(idx, result)| SourceAttribution {
            source_id: idx + 1,
            chunk_id: result.chunk.id.clone(),
            document_id: result.chunk.document_id,
            filename: result.filename.clone(),
            page: result.chunk.page,
            ordinal: result.chunk.ordinal,
            score: result.score,
            snippet: snippet(&result.chunk.content),
        })
        .collect()
}

fn snippet(text: &str) -> String {
    if text.chars().count() <= SNIPPET_CHARS {
        return text.to_string();
    }
    let mut preview: String = text.chars().take(SNIPPET_CHARS).collect();
    preview.push_str("...");
    preview
}

/// Confidence in [0, 1] from the similarity scores of the chunks used.
pub fn compute_confidence(formula: ConfidenceFormula, scores: &[f32], top_k: usize) -> f32 {
    if scores.is_empty() {
        return 0.0;
    }

    let value = match formula {
        ConfidenceFormula::Mean => scores.iter().sum::<f32>() / scores.len() as f32,
        ConfidenceFormula::Max => scores.iter().copied().fold(f32::MIN, f32::max),
        ConfidenceFormula::Weighted => {
            let top = scores.iter().copied().fold(f32::MIN, f32::max);
            let coverage = (scores.len() as f32 / top_k.max(1) as f32).min(1.0);
            0.7 * top + 0.3 * coverage
        }
    };
    value.clamp(0.0, 1.0)
}
