use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::config::{HttpConfig, VectorConfig};
use crate::error::{AppError, Result, Service};
use crate::retry::RetryPolicy;
use crate::traits::{ChunkPayload, IndexedVector, VectorHit, VectorIndex, VectorQuery};

/// Qdrant collection accessed over its REST API. Works against a local
/// instance or Qdrant Cloud (when an API key is configured).
#[derive(Clone)]
pub struct QdrantStore {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    collection: String,
    known_vector_size: Arc<RwLock<Option<usize>>>,
    retry: RetryPolicy,
}

impl QdrantStore {
    pub fn new(config: &VectorConfig, http: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(http.timeout)
            .build()
            .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            collection: config.collection.clone(),
            known_vector_size: Arc::new(RwLock::new(None)),
            retry: RetryPolicy::from(http),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.collection, suffix)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("api-key", key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        self.authorized(request)
            .send()
            .await
            .map_err(|err| AppError::from_reqwest(Service::VectorIndex, err))
    }

    /// Creates the collection on first use. Vectors use cosine distance and
    /// `document_id` gets a payload index so filtered search and delete stay
    /// cheap. A 409 from either PUT means another writer got there first.
    pub async fn ensure_collection(&self, vector_size: usize) -> Result<()> {
        if let Some(existing) = *self.known_vector_size.read().await {
            return self.check_dimension(existing, vector_size);
        }

        let url = self.collection_url("");
        let existing: Option<Option<usize>> = self
            .retry
            .run("qdrant get collection", || async {
                let response = self.send(self.client.get(&url)).await?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                let response = ensure_success(response).await?;
                let info: Value = response.json().await.map_err(decode_error)?;
                Ok(Some(
                    info.pointer("/result/config/params/vectors/size")
                        .and_then(Value::as_u64)
                        .map(|size| size as usize),
                ))
            })
            .await?;

        match existing {
            Some(Some(existing)) => self.check_dimension(existing, vector_size)?,
            Some(None) => {}
            None => {
                tracing::info!(
                    "creating qdrant collection {} ({} dims)",
                    self.collection,
                    vector_size
                );
                let payload = json!({
                    "vectors": {
                        "size": vector_size,
                        "distance": "Cosine"
                    }
                });
                self.put_tolerating_conflict("qdrant create collection", &url, &payload)
                    .await?;

                let index = json!({
                    "field_name": "document_id",
                    "field_schema": "integer"
                });
                let index_url = self.collection_url("/index?wait=true");
                self.put_tolerating_conflict(
                    "qdrant create payload index",
                    &index_url,
                    &index,
                )
                .await?;
            }
        }

        *self.known_vector_size.write().await = Some(vector_size);
        Ok(())
    }

    async fn put_tolerating_conflict(&self, op: &str, url: &str, body: &Value) -> Result<()> {
        self.retry
            .run(op, || async {
                let response = self.send(self.client.put(url).json(body)).await?;
                if response.status() == StatusCode::CONFLICT {
                    tracing::debug!("{op}: already exists");
                    return Ok(());
                }
                check_status(response).await
            })
            .await
    }

    fn check_dimension(&self, existing: usize, vector_size: usize) -> Result<()> {
        if existing == vector_size {
            return Ok(());
        }
        Err(AppError::service(
            Service::VectorIndex,
            false,
            format!(
                "collection {} holds {existing}-dimensional vectors, got {vector_size}",
                self.collection
            ),
        ))
    }
}

#[async_trait]
impl VectorIndex for QdrantStore {
    async fn upsert(&self, points: &[IndexedVector]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let vector_size = points[0].vector.len();
        if points.iter().any(|point| point.vector.len() != vector_size) {
            return Err(AppError::service(
                Service::Embedding,
                false,
                "embedder returned vectors of different dimensions",
            ));
        }
        self.ensure_collection(vector_size).await?;

        let body = json!({
            "points": points
                .iter()
                .map(|point| QdrantPoint {
                    id: &point.id,
                    vector: &point.vector,
                    payload: &point.payload,
                })
                .collect::<Vec<_>>()
        });
        let url = self.collection_url("/points?wait=true");

        self.retry
            .run("qdrant upsert", || async {
                let response = self.send(self.client.put(&url).json(&body)).await?;
                check_status(response).await
            })
            .await
    }

    async fn query(&self, vector: &[f32], query: &VectorQuery) -> Result<Vec<VectorHit>> {
        if vector.is_empty() || query.top_k == 0 {
            return Ok(vec![]);
        }

        let mut body = json!({
            "vector": vector,
            "limit": query.top_k,
            "with_payload": true,
        });
        if let Some(floor) = query.score_floor {
            body["score_threshold"] = json!(floor);
        }
        if let Some(ids) = query.document_ids.as_ref().filter(|ids| !ids.is_empty()) {
            body["filter"] = json!({
                "must": [
                    { "key": "document_id", "match": { "any": ids } }
                ]
            });
        }

        let url = self.collection_url("/points/search");
        let response: Option<QdrantSearchResponse> = self
            .retry
            .run("qdrant search", || async {
                let response = self.send(self.client.post(&url).json(&body)).await?;
                if response.status() == StatusCode::NOT_FOUND {
                    // nothing has been indexed yet
                    return Ok(None);
                }
                let response = ensure_success(response).await?;
                let parsed = response
                    .json::<QdrantSearchResponse>()
                    .await
                    .map_err(decode_error)?;
                Ok(Some(parsed))
            })
            .await?;

        let Some(response) = response else {
            return Ok(vec![]);
        };

        Ok(response
            .result
            .into_iter()
            .filter_map(|point| {
                let payload = point.payload?;
                Some(VectorHit {
                    chunk_id: payload.chunk_id,
                    document_id: payload.document_id,
                    score: point.score,
                })
            })
            .collect())
    }

    async fn delete_document(&self, document_id: i64) -> Result<()> {
        let body = json!({
            "filter": {
                "must": [
                    { "key": "document_id", "match": { "value": document_id } }
                ]
            }
        });
        let url = self.collection_url("/points/delete?wait=true");

        self.retry
            .run("qdrant delete", || async {
                let response = self.send(self.client.post(&url).json(&body)).await?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(());
                }
                check_status(response).await
            })
            .await
    }

    async fn count_document(&self, document_id: i64) -> Result<u64> {
        let body = json!({
            "filter": {
                "must": [
                    { "key": "document_id", "match": { "value": document_id } }
                ]
            },
            "exact": true
        });
        let url = self.collection_url("/points/count");

        self.retry
            .run("qdrant count", || async {
                let response = self.send(self.client.post(&url).json(&body)).await?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(0);
                }
                let response = ensure_success(response).await?;
                let parsed: QdrantCountResponse =
                    response.json().await.map_err(decode_error)?;
                Ok(parsed.result.count)
            })
            .await
    }

    async fn health(&self) -> Result<()> {
        let url = format!("{}/collections", self.base_url);
        let response = self.send(self.client.get(url)).await?;
        check_status(response).await
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AppError::from_status(Service::VectorIndex, status, &body))
}

async fn check_status(response: Response) -> Result<()> {
    ensure_success(response).await.map(|_| ())
}

fn decode_error(err: reqwest::Error) -> AppError {
    AppError::service(
        Service::VectorIndex,
        false,
        format!("failed to decode qdrant response: {err}"),
    )
}

#[derive(Serialize)]
struct QdrantPoint<'a> {
    id: &'a str,
    vector: &'a [f32],
    payload: &'a ChunkPayload,
}

#[derive(Debug, Deserialize)]
struct QdrantSearchResponse {
    result: Vec<QdrantResultPoint>,
}

#[derive(Debug, Deserialize)]
struct QdrantResultPoint {
    score: f32,
    payload: Option<ChunkPayload>,
}

#[derive(Debug, Deserialize)]
struct QdrantCountResponse {
    result: QdrantCount,
}

#[derive(Debug, Deserialize)]
struct QdrantCount {
    count: u64,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn store_for(server: &MockServer, api_key: Option<&str>) -> QdrantStore {
        let vector = VectorConfig {
            url: server.uri(),
            api_key: api_key.map(str::to_string),
            collection: "docs".to_string(),
        };
        let http = HttpConfig {
            timeout: Duration::from_secs(5),
            max_retries: 1,
            retry_base_delay: Duration::from_millis(1),
            max_concurrent_generations: 1,
        };
        QdrantStore::new(&vector, &http).unwrap()
    }

    fn point(id: &str, document_id: i64) -> IndexedVector {
        IndexedVector {
            id: id.to_string(),
            vector: vec![0.1, 0.2, 0.3],
            payload: ChunkPayload {
                chunk_id: id.to_string(),
                document_id,
                ordinal: 0,
                page: Some(1),
                text: "hello".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn upsert_creates_missing_collection_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/docs"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/collections/docs"))
            .and(header("api-key", "secret"))
            .and(body_partial_json(json!({
                "vectors": { "size": 3, "distance": "Cosine" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": true })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/collections/docs/index"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": {} })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/collections/docs/points"))
            .and(body_partial_json(json!({
                "points": [ { "id": "a", "payload": { "document_id": 7 } } ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": {} })))
            .expect(2)
            .mount(&server)
            .await;

        let store = store_for(&server, Some("secret"));
        store.upsert(&[point("a", 7)]).await.unwrap();
        store.upsert(&[point("a", 7)]).await.unwrap();
    }

    #[tokio::test]
    async fn query_sends_floor_and_document_filter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/docs/points/search"))
            .and(body_partial_json(json!({
                "limit": 5,
                "score_threshold": 0.5,
                "filter": { "must": [ { "key": "document_id", "match": { "any": [3, 4] } } ] }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [
                    {
                        "id": "c1",
                        "score": 0.91,
                        "payload": {
                            "chunk_id": "c1",
                            "document_id": 3,
                            "ordinal": 2,
                            "page": 4,
                            "text": "refunds"
                        }
                    },
                    { "id": "c2", "score": 0.6 }
                ]
            })))
            .mount(&server)
            .await;

        let store = store_for(&server, None);
        let hits = store
            .query(
                &[1.0, 0.0, 0.0],
                &VectorQuery {
                    top_k: 5,
                    score_floor: Some(0.5),
                    document_ids: Some(vec![3, 4]),
                },
            )
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c1");
        assert_eq!(hits[0].document_id, 3);
        assert!((hits[0].score - 0.91).abs() < 1e-6);
    }

    #[tokio::test]
    async fn missing_collection_means_no_hits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/docs/points/search"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(json!({ "status": { "error": "Not found: Collection `docs` doesn't exist!" } })),
            )
            .mount(&server)
            .await;

        let store = store_for(&server, None);
        let hits = store
            .query(
                &[1.0, 0.0, 0.0],
                &VectorQuery {
                    top_k: 3,
                    ..VectorQuery::default()
                },
            )
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn delete_and_count_filter_by_document() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/docs/points/delete"))
            .and(body_partial_json(json!({
                "filter": { "must": [ { "key": "document_id", "match": { "value": 7 } } ] }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": {} })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/collections/docs/points/count"))
            .and(body_partial_json(json!({ "exact": true })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "result": { "count": 12 } })),
            )
            .mount(&server)
            .await;

        let store = store_for(&server, None);
        assert_eq!(store.count_document(7).await.unwrap(), 12);
        store.delete_document(7).await.unwrap();
    }

    #[tokio::test]
    async fn unavailable_service_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/docs/points/delete"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let store = store_for(&server, None);
        let err = store.delete_document(1).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn mixed_dimensions_are_rejected() {
        let server = MockServer::start().await;
        let store = store_for(&server, None);
        let mut other = point("b", 1);
        other.vector = vec![1.0];

        let err = store.upsert(&[point("a", 1), other]).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Service {
                service: Service::Embedding,
                transient: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn collection_created_by_another_writer_is_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/docs"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/collections/docs"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "status": { "error": "Wrong input: Collection `docs` already exists!" }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/collections/docs/index"))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/collections/docs/points"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": {} })))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server, None);
        store.upsert(&[point("a", 7)]).await.unwrap();
    }

    #[tokio::test]
    async fn collection_lookup_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/docs"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/collections/docs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": { "config": { "params": { "vectors": { "size": 3, "distance": "Cosine" } } } }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/collections/docs"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/collections/docs/points"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": {} })))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server, None);
        store.upsert(&[point("a", 7)]).await.unwrap();
    }

    #[tokio::test]
    async fn existing_collection_with_other_dimension_is_refused() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/docs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": { "config": { "params": { "vectors": { "size": 1536 } } } }
            })))
            .mount(&server)
            .await;

        let store = store_for(&server, None);
        let err = store.ensure_collection(3).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Service {
                service: Service::VectorIndex,
                transient: false,
                ..
            }
        ));
    }
}
