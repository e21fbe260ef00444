//! Qdrant REST index client.
//!
//! Talks to a Qdrant-compatible endpoint over plain REST. Transient failures
//! (429, 5xx, timeouts) are retried with capped exponential backoff; schema
//! conflicts and auth failures are surfaced immediately.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::config::IndexConfig;
use crate::error::{PipelineError, Result};

use super::{ChunkPayload, CollectionSpec, EmbeddingRecord, ScoredRecord, VectorIndex};

/// Async Qdrant REST client.
pub struct QdrantIndex {
    client: reqwest::Client,
    endpoint: String,
    max_retries: u32,
}

impl QdrantIndex {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        if !config.endpoint.starts_with("http://") && !config.endpoint.starts_with("https://") {
            return Err(PipelineError::config(
                "index.endpoint must be an http(s) URL",
            ));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(api_key) = std::env::var(&config.api_key_env) {
            if !api_key.trim().is_empty() {
                let value = HeaderValue::from_str(api_key.trim())
                    .map_err(|_| PipelineError::Auth("index API key is not a valid header value".into()))?;
                headers.insert("api-key", value);
            }
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| PipelineError::Network(format!("failed to build index client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
        })
    }

    /// Send one request with the transient-retry policy, returning the final
    /// status and body.
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<(StatusCode, String)> {
        let mut attempt = 0u32;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if status.is_success() || !should_retry(status) || attempt >= self.max_retries {
                        return Ok((status, body));
                    }
                    attempt += 1;
                    tracing::warn!(%status, attempt, "index request failed, retrying");
                    tokio::time::sleep(retry_backoff(attempt)).await;
                }
                Err(err) => {
                    let transient = err.is_connect() || err.is_timeout() || err.is_request();
                    if !transient || attempt >= self.max_retries {
                        return Err(PipelineError::Index(format!("index request failed: {err}")));
                    }
                    attempt += 1;
                    tracing::warn!(error = %err, attempt, "index request failed, retrying");
                    tokio::time::sleep(retry_backoff(attempt)).await;
                }
            }
        }
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/collections/{collection}", self.endpoint)
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_backoff(attempt: u32) -> Duration {
    let capped = attempt.min(5);
    Duration::from_millis(500 * (1u64 << capped))
}

/// Qdrant point ids must be unsigned integers or UUIDs; arbitrary strings
/// like a hex digest are rejected with HTTP 400. The point id is therefore a
/// deterministic v5 UUID of the chunk id, and the chunk id itself rides in
/// the payload.
fn point_id(chunk_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, chunk_id.as_bytes()).to_string()
}

fn classify_failure(status: StatusCode, body: &str, context: &str) -> PipelineError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            PipelineError::Auth(format!("{context}: HTTP {status}"))
        }
        _ => PipelineError::Index(format!("{context}: HTTP {status}: {body}")),
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct CollectionInfoEnvelope {
    result: CollectionInfo,
}

#[derive(Debug, Deserialize)]
struct CollectionInfo {
    config: CollectionConfig,
}

#[derive(Debug, Deserialize)]
struct CollectionConfig {
    params: CollectionParams,
}

#[derive(Debug, Deserialize)]
struct CollectionParams {
    vectors: VectorParams,
}

#[derive(Debug, Deserialize)]
struct VectorParams {
    size: usize,
    distance: String,
}

#[derive(Debug, Serialize)]
struct PointStruct<'a> {
    id: String,
    vector: &'a [f32],
    payload: &'a ChunkPayload,
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    result: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    id: serde_json::Value,
    score: f32,
    payload: ChunkPayload,
}

#[derive(Debug, Deserialize)]
struct CountEnvelope {
    result: CountResult,
}

#[derive(Debug, Deserialize)]
struct CountResult {
    count: usize,
}

// ============================================================================
// VectorIndex Implementation
// ============================================================================

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<()> {
        let url = self.collection_url(&spec.name);

        // Existing collection: verify the declared schema.
        let (status, body) = self.send_with_retry(|| self.client.get(&url)).await?;
        if status.is_success() {
            let info: CollectionInfoEnvelope = serde_json::from_str(&body)
                .map_err(|e| PipelineError::Index(format!("bad collection info: {e}")))?;
            let params = &info.result.config.params.vectors;
            if params.size != spec.vector_size || params.distance != spec.distance.as_str() {
                return Err(PipelineError::schema(format!(
                    "collection '{}' exists with size {} / {}, config declares {} / {}",
                    spec.name,
                    params.size,
                    params.distance,
                    spec.vector_size,
                    spec.distance.as_str()
                )));
            }
            return Ok(());
        }
        if status != StatusCode::NOT_FOUND {
            return Err(classify_failure(status, &body, "collection lookup"));
        }

        // Missing: create it.
        let create_body = json!({
            "vectors": {
                "size": spec.vector_size,
                "distance": spec.distance.as_str(),
            }
        });
        let (status, body) = self
            .send_with_retry(|| self.client.put(&url).json(&create_body))
            .await?;
        if !status.is_success() {
            return Err(classify_failure(status, &body, "collection create"));
        }
        tracing::info!(collection = %spec.name, size = spec.vector_size, "collection created");
        Ok(())
    }

    async fn upsert_batch(&self, collection: &str, records: Vec<EmbeddingRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let points: Vec<PointStruct> = records
            .iter()
            .map(|r| PointStruct {
                id: point_id(&r.id),
                vector: &r.vector,
                payload: &r.payload,
            })
            .collect();

        // wait=true makes the whole batch visible before the call returns.
        let url = format!("{}/points?wait=true", self.collection_url(collection));
        let body = json!({ "points": points });
        let (status, resp_body) = self
            .send_with_retry(|| self.client.put(&url).json(&body))
            .await?;
        if !status.is_success() {
            return Err(classify_failure(status, &resp_body, "points upsert"));
        }
        tracing::debug!(collection, points = records.len(), "batch upserted");
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredRecord>> {
        let url = format!("{}/points/search", self.collection_url(collection));
        let body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        let (status, resp_body) = self
            .send_with_retry(|| self.client.post(&url).json(&body))
            .await?;
        if !status.is_success() {
            return Err(classify_failure(status, &resp_body, "search"));
        }

        let envelope: SearchEnvelope = serde_json::from_str(&resp_body)
            .map_err(|e| PipelineError::Index(format!("bad search response: {e}")))?;
        Ok(envelope
            .result
            .into_iter()
            .map(|hit| {
                // Prefer the chunk id stored in the payload; the point id is
                // its derived UUID form.
                let id = if hit.payload.chunk_id.is_empty() {
                    match hit.id {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    }
                } else {
                    hit.payload.chunk_id.clone()
                };
                ScoredRecord {
                    id,
                    score: hit.score,
                    payload: hit.payload,
                }
            })
            .collect())
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let url = format!("{}/points/count", self.collection_url(collection));
        let (status, body) = self
            .send_with_retry(|| self.client.post(&url).json(&json!({"exact": true})))
            .await?;
        if !status.is_success() {
            return Err(classify_failure(status, &body, "count"));
        }
        let envelope: CountEnvelope = serde_json::from_str(&body)
            .map_err(|e| PipelineError::Index(format!("bad count response: {e}")))?;
        Ok(envelope.result.count)
    }

    fn name(&self) -> &'static str {
        "qdrant"
    }
}

// ============================================================================
// Tests
// ============================================================================
