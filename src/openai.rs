use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::{HttpConfig, ModelConfig};
use crate::error::{AppError, Result, Service};
use crate::retry::RetryPolicy;
use crate::traits::{Embedder, LanguageModel, Prompt};

/// Client for an OpenAI-compatible API, used for both embeddings and
/// chat completions.
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
    embedding_model: String,
    answer_model: String,
    batch_size: usize,
    max_tokens: usize,
    temperature: f32,
    retry: RetryPolicy,
}

impl OpenAiClient {
    pub fn new(models: &ModelConfig, http: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(http.timeout)
            .build()
            .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;

        Ok(Self {
            client,
            base_url: models.base_url.clone(),
            api_key: models.api_key.clone(),
            embedding_model: models.embedding_model.clone(),
            answer_model: models.answer_model.clone(),
            batch_size: models.embedding_batch_size.max(1),
            max_tokens: models.max_answer_tokens,
            temperature: models.temperature,
            retry: RetryPolicy::from(http),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        #[derive(Serialize)]
        struct EmbedReq<'a> {
            model: &'a str,
            input: &'a [String],
        }

        #[derive(Deserialize)]
        struct EmbedResp {
            data: Vec<EmbedData>,
        }

        #[derive(Deserialize)]
        struct EmbedData {
            #[serde(default)]
            index: Option<usize>,
            embedding: Vec<f32>,
        }

        let url = format!("{}/embeddings", self.base_url);
        let response: EmbedResp = self
            .retry
            .run("embedding request", || async {
                let response = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .json(&EmbedReq {
                        model: &self.embedding_model,
                        input: texts,
                    })
                    .send()
                    .await
                    .map_err(|err| AppError::from_reqwest(Service::Embedding, err))?;
                decode_json(Service::Embedding, response).await
            })
            .await?;

        if response.data.len() != texts.len() {
            return Err(AppError::service(
                Service::Embedding,
                false,
                format!(
                    "expected {} embeddings, received {}",
                    texts.len(),
                    response.data.len()
                ),
            ));
        }

        let mut data = response.data;
        if data.iter().all(|item| item.index.is_some()) {
            data.sort_by_key(|item| item.index);
        }

        let vectors: Vec<Vec<f32>> = data.into_iter().map(|item| item.embedding).collect();
        if vectors.iter().any(|vector| vector.is_empty()) {
            return Err(AppError::service(
                Service::Embedding,
                false,
                "embedding response contained an empty vector",
            ));
        }

        Ok(vectors)
    }

    async fn check_models_endpoint(&self, service: Service) -> Result<()> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|err| AppError::from_reqwest(service, err))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::from_status(service, status, &body));
        }
        Ok(())
    }
}

#[async_trait]
impl Embedder for OpenAiClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.iter().any(|text| text.trim().is_empty()) {
            return Err(AppError::Validation(
                "cannot embed empty text input".to_string(),
            ));
        }

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }

    async fn health(&self) -> Result<()> {
        self.check_models_endpoint(Service::Embedding).await
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete(&self, prompt: &Prompt) -> Result<String> {
        #[derive(Serialize)]
        struct ChatReq<'a> {
            model: &'a str,
            messages: Vec<ChatMessage<'a>>,
            temperature: f32,
            max_tokens: usize,
        }

        #[derive(Serialize)]
        struct ChatMessage<'a> {
            role: &'a str,
            content: &'a str,
        }

        #[derive(Deserialize)]
        struct ChatResp {
            choices: Vec<ChatChoice>,
        }

        #[derive(Deserialize)]
        struct ChatChoice {
            message: ChatChoiceMessage,
        }

        #[derive(Deserialize)]
        struct ChatChoiceMessage {
            #[serde(default)]
            content: Option<String>,
        }

        let url = format!("{}/chat/completions", self.base_url);
        let response: ChatResp = self
            .retry
            .run("chat completion", || async {
                let response = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .json(&ChatReq {
                        model: &self.answer_model,
                        messages: vec![
                            ChatMessage {
                                role: "system",
                                content: &prompt.system,
                            },
                            ChatMessage {
                                role: "user",
                                content: &prompt.user,
                            },
                        ],
                        temperature: self.temperature,
                        max_tokens: self.max_tokens,
                    })
                    .send()
                    .await
                    .map_err(|err| AppError::from_reqwest(Service::LanguageModel, err))?;
                decode_json(Service::LanguageModel, response).await
            })
            .await?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|text| text.trim().to_string())
            .unwrap_or_default();

        if content.is_empty() {
            return Err(AppError::service(
                Service::LanguageModel,
                false,
                "language model returned an empty completion",
            ));
        }

        Ok(content)
    }

    async fn health(&self) -> Result<()> {
        self.check_models_endpoint(Service::LanguageModel).await
    }
}

async fn decode_json<T>(service: Service, response: reqwest::Response) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let status = response.status();
    if status != StatusCode::OK {
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::from_status(service, status, &body));
    }

    response.json::<T>().await.map_err(|err| {
        AppError::service(service, false, format!("failed to decode response: {err}"))
    })
}
