//! Embedding stage - Chunks become vectors.
//!
//! A provider trait fronts the actual embedding API; the [`Embedder`] drives
//! batching, over-length truncation, failure isolation and vector
//! normalization on top of it.
//!
//! ## Usage
//! ```rust,ignore
//! let provider = Arc::new(GeminiEmbedding::from_env(768)?);
//! let embedder = Embedder::new(provider, config.embedder.clone());
//! let outcome = embedder.embed_chunks(&chunks).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::EmbedderConfig;
use crate::error::{PipelineError, Result};
use crate::index::EmbeddingRecord;
use crate::normalize::Chunk;

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// Interface to a text-embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Vector dimensionality this provider produces.
    fn dimension(&self) -> usize;

    /// Provider name for logs and status output.
    fn name(&self) -> &str;
}

// ============================================================================
// Google Gemini Embedding
// ============================================================================

/// Gemini batch embedding endpoint (gemini-embedding-001, MRL dimensions).
const GEMINI_EMBED_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models/gemini-embedding-001:batchEmbedContents";

/// Initial backoff for 429/5xx retries (ms).
const INITIAL_BACKOFF_MS: u64 = 2000;
/// Delay between whole-batch retries at the embedder level (ms).
const BATCH_RETRY_DELAY_MS: u64 = 200;
/// Provider-internal retry budget per batch call.
const MAX_RETRIES: u32 = 3;

/// Gemini embedding client.
#[derive(Debug)]
pub struct GeminiEmbedding {
    api_key: String,
    client: reqwest::Client,
    dimension: usize,
}

impl GeminiEmbedding {
    pub fn new(api_key: String, dimension: usize) -> Result<Self> {
        if ![768, 1536, 3072].contains(&dimension) {
            return Err(PipelineError::config(format!(
                "invalid embedding dimension {dimension}: must be 768, 1536, or 3072"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PipelineError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_key,
            client,
            dimension,
        })
    }

    /// Read the API key from `GEMINI_API_KEY` / `GOOGLE_AI_API_KEY`.
    pub fn from_env(dimension: usize) -> Result<Self> {
        Self::new(get_api_key()?, dimension)
    }
}

#[derive(Debug, Serialize)]
struct BatchEmbedRequest {
    requests: Vec<EmbedRequest>,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    content: EmbedContent,
    #[serde(rename = "taskType")]
    task_type: String,
    #[serde(rename = "outputDimensionality")]
    output_dimensionality: usize,
}

#[derive(Debug, Serialize)]
struct EmbedContent {
    parts: Vec<EmbedPart>,
}

#[derive(Debug, Serialize)]
struct EmbedPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedding {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = BatchEmbedRequest {
            requests: texts
                .iter()
                .map(|text| EmbedRequest {
                    model: "models/gemini-embedding-001".to_string(),
                    content: EmbedContent {
                        parts: vec![EmbedPart { text: text.clone() }],
                    },
                    task_type: "RETRIEVAL_DOCUMENT".to_string(),
                    output_dimensionality: self.dimension,
                })
                .collect(),
        };

        let mut last_error = String::new();

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let backoff = Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1));
                tracing::warn!(?backoff, attempt, "embedding request retry");
                tokio::time::sleep(backoff).await;
            }

            let response = match self
                .client
                .post(GEMINI_EMBED_URL)
                .header("x-goog-api-key", &self.api_key)
                .json(&request)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = format!("failed to send embedding request: {e}");
                    continue;
                }
            };

            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            if status.is_success() {
                let parsed: BatchEmbedResponse = serde_json::from_str(&body).map_err(|e| {
                    PipelineError::Network(format!("bad embedding response: {e}"))
                })?;
                if parsed.embeddings.len() != texts.len() {
                    return Err(PipelineError::Network(format!(
                        "provider returned {} embeddings for {} inputs",
                        parsed.embeddings.len(),
                        texts.len()
                    )));
                }
                return Ok(parsed.embeddings.into_iter().map(|e| e.values).collect());
            }

            match status.as_u16() {
                401 | 403 => {
                    return Err(PipelineError::Auth(format!(
                        "embedding API rejected credentials: HTTP {status}"
                    )))
                }
                429 | 500..=599 => {
                    last_error = format!("HTTP {status}: {body}");
                }
                _ => {
                    return Err(PipelineError::Network(format!(
                        "embedding API error: HTTP {status}: {body}"
                    )))
                }
            }
        }

        Err(PipelineError::Network(format!(
            "embedding failed after {MAX_RETRIES} retries: {last_error}"
        )))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "gemini-embedding-001"
    }
}

// ============================================================================
// Embedder
// ============================================================================

/// Result of embedding a set of chunks. A batch that keeps failing is halved
/// once to isolate the failure, so the outcome can be partial.
#[derive(Debug, Default)]
pub struct EmbedOutcome {
    pub records: Vec<EmbeddingRecord>,
    /// Chunk ids whose batch (or half-batch) failed after all retries.
    pub failed: Vec<String>,
}

/// Batching layer over an [`EmbeddingProvider`].
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    config: EmbedderConfig,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: EmbedderConfig) -> Self {
        Self { provider, config }
    }

    /// Embed chunks in configured batches.
    ///
    /// A failing batch is retried as a whole up to `max_retries`; only that
    /// batch, never its neighbors. A batch that keeps failing is split in
    /// half and each half gets one more chance, which isolates a single bad
    /// input to half a batch instead of sinking the whole run.
    pub async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<EmbedOutcome> {
        let mut outcome = EmbedOutcome::default();

        for batch in chunks.chunks(self.config.batch_size.max(1)) {
            match self.embed_batch_with_retry(batch).await {
                Ok(records) => outcome.records.extend(records),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, size = batch.len(), "batch failed, halving");
                    let mid = batch.len().div_ceil(2);
                    for half in [&batch[..mid], &batch[mid..]] {
                        if half.is_empty() {
                            continue;
                        }
                        match self.embed_one_batch(half).await {
                            Ok(records) => outcome.records.extend(records),
                            Err(e) if e.is_fatal() => return Err(e),
                            Err(e) => {
                                tracing::warn!(error = %e, size = half.len(), "half-batch failed, skipping");
                                outcome.failed.extend(half.iter().map(|c| c.id.clone()));
                            }
                        }
                    }
                }
            }
        }

        tracing::info!(
            embedded = outcome.records.len(),
            failed = outcome.failed.len(),
            "embedding complete"
        );
        Ok(outcome)
    }

    /// Retry one batch as a whole. Fatal errors cut the loop short.
    async fn embed_batch_with_retry(&self, batch: &[Chunk]) -> Result<Vec<EmbeddingRecord>> {
        let mut last_error = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(BATCH_RETRY_DELAY_MS * attempt as u64))
                    .await;
                tracing::debug!(attempt, size = batch.len(), "retrying batch");
            }
            match self.embed_one_batch(batch).await {
                Ok(records) => return Ok(records),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| PipelineError::Network("batch retry loop produced no error".into())))
    }

    async fn embed_one_batch(&self, batch: &[Chunk]) -> Result<Vec<EmbeddingRecord>> {
        let texts: Vec<String> = batch
            .iter()
            .map(|c| truncate_for_embedding(&c.content, self.config.max_length))
            .collect();

        let vectors = self.provider.embed_batch(&texts).await?;

        let mut records = Vec::with_capacity(batch.len());
        for (chunk, mut vector) in batch.iter().zip(vectors) {
            if vector.len() != self.config.vector_size {
                return Err(PipelineError::schema(format!(
                    "provider produced {}-dim vector, collection expects {}",
                    vector.len(),
                    self.config.vector_size
                )));
            }
            if self.config.normalize_embeddings {
                l2_normalize(&mut vector);
            }
            records.push(EmbeddingRecord::from_chunk(chunk, vector));
        }
        Ok(records)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Truncate text to roughly `max_tokens` (4 chars per token), cutting at the
/// last word boundary inside the budget.
pub fn truncate_for_embedding(text: &str, max_tokens: usize) -> String {
    let char_budget = max_tokens.saturating_mul(4);
    if text.len() <= char_budget {
        return text.to_string();
    }
    let cut = floor_char_boundary(text, char_budget);
    let head = &text[..cut];
    match head.rfind(char::is_whitespace) {
        Some(pos) if pos > 0 => head[..pos].to_string(),
        _ => head.to_string(),
    }
}

fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

#[inline]
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        s.len()
    } else {
        let mut i = index;
        while i > 0 && !s.is_char_boundary(i) {
            i -= 1;
        }
        i
    }
}

// ============================================================================
// API Key Management
// ============================================================================

/// Load the Gemini API key. Priority: GEMINI_API_KEY, then GOOGLE_AI_API_KEY.
pub fn get_api_key() -> Result<String> {
    for var in ["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"] {
        if let Ok(key) = std::env::var(var) {
            if !key.is_empty() {
                tracing::debug!("using API key from {var}");
                return Ok(key);
            }
        }
    }
    Err(PipelineError::Auth(
        "API key not found. Set GEMINI_API_KEY or GOOGLE_AI_API_KEY.".into(),
    ))
}

pub fn has_api_key() -> bool {
    ["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"]
        .iter()
        .any(|var| std::env::var(var).map(|k| !k.is_empty()).unwrap_or(false))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::{ContentType, Document};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Test provider: counts calls, fails any batch containing "poison".
    struct FakeProvider {
        dimension: usize,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn new(dimension: usize) -> Self {
            Self {
                dimension,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FakeProvider {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if texts.iter().any(|t| t.contains("poison")) {
                return Err(PipelineError::Network("provider rejected batch".into()));
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0; self.dimension];
                    v[0] = t.len() as f32;
                    v
                })
                .collect())
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn name(&self) -> &str {
            "fake"
        }
    }

    fn make_chunks(contents: &[&str]) -> Vec<Chunk> {
        let doc = Document::from_text("https://docs.example.dev/p", String::new(), ContentType::Html);
        contents
            .iter()
            .enumerate()
            .map(|(i, content)| Chunk {
                id: format!("chunk-{i}"),
                document_id: doc.id,
                source_uri: doc.source_uri.clone(),
                content_type: doc.content_type,
                position: i,
                content: content.to_string(),
                language: None,
                summary: None,
                tags: Default::default(),
                acquired_at: doc.acquired_at,
            })
            .collect()
    }

    fn small_config(dim: usize, batch_size: usize) -> EmbedderConfig {
        EmbedderConfig {
            vector_size: dim,
            batch_size,
            max_retries: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_batching_by_configured_size() {
        let provider = Arc::new(FakeProvider::new(4));
        let embedder = Embedder::new(provider.clone(), small_config(4, 2));
        let chunks = make_chunks(&["one", "two", "three", "four", "five"]);

        let outcome = embedder.embed_chunks(&chunks).await.unwrap();
        assert_eq!(outcome.records.len(), 5);
        assert!(outcome.failed.is_empty());
        // 5 chunks at batch size 2 -> 3 provider calls.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    // A persistently failing batch is halved once; the surviving half is kept.
    #[tokio::test]
    async fn test_failed_batch_is_halved_to_isolate_failure() {
        let provider = Arc::new(FakeProvider::new(4));
        let embedder = Embedder::new(provider.clone(), small_config(4, 4));
        let chunks = make_chunks(&["good one", "good two", "poison pill", "good three"]);

        let outcome = embedder.embed_chunks(&chunks).await.unwrap();
        // First half ["good one", "good two"] survives; second half carries
        // the poison and is skipped.
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.failed, vec!["chunk-2", "chunk-3"]);
        // Full batch + two halves.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    /// Fails its Nth call once, succeeds otherwise.
    struct FlakyProvider {
        dimension: usize,
        calls: AtomicUsize,
        fail_on_call: usize,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyProvider {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.fail_on_call {
                return Err(PipelineError::Network("transient failure".into()));
            }
            Ok(texts.iter().map(|_| vec![1.0; self.dimension]).collect())
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    // 100 chunks at batch_size 32 embed in batches of 32/32/32/4;
    // a transient failure on batch 3 retries exactly that batch.
    #[tokio::test]
    async fn test_transient_batch_failure_retries_only_that_batch() {
        let provider = Arc::new(FlakyProvider {
            dimension: 4,
            calls: AtomicUsize::new(0),
            fail_on_call: 3,
        });
        let config = EmbedderConfig {
            vector_size: 4,
            batch_size: 32,
            max_retries: 1,
            ..Default::default()
        };
        let embedder = Embedder::new(provider.clone(), config);
        let contents: Vec<String> = (0..100).map(|i| format!("chunk body {i}")).collect();
        let refs: Vec<&str> = contents.iter().map(String::as_str).collect();
        let chunks = make_chunks(&refs);

        let outcome = embedder.embed_chunks(&chunks).await.unwrap();
        assert_eq!(outcome.records.len(), 100);
        assert!(outcome.failed.is_empty());
        // Batches 1, 2, 4 once each; batch 3 twice.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_fatal() {
        let provider = Arc::new(FakeProvider::new(4));
        // Collection declared at 8, provider produces 4.
        let embedder = Embedder::new(provider, small_config(8, 2));
        let chunks = make_chunks(&["some content"]);

        let err = embedder.embed_chunks(&chunks).await.unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMismatch { .. }));
    }

    #[tokio::test]
    async fn test_vectors_are_normalized() {
        let provider = Arc::new(FakeProvider::new(4));
        let embedder = Embedder::new(provider, small_config(4, 2));
        let chunks = make_chunks(&["anything"]);

        let outcome = embedder.embed_chunks(&chunks).await.unwrap();
        let norm: f32 = outcome.records[0]
            .vector
            .iter()
            .map(|x| x * x)
            .sum::<f32>()
            .sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_truncation_at_word_boundary() {
        let text = "alpha beta gamma delta epsilon";
        // 2 tokens -> 8 char budget -> cut inside "beta", back to "alpha".
        let truncated = truncate_for_embedding(text, 2);
        assert_eq!(truncated, "alpha");

        // Large budget leaves text untouched.
        assert_eq!(truncate_for_embedding(text, 100), text);
    }

    #[test]
    fn test_truncation_multibyte_safe() {
        let text = "héllo wörld ünïcode téxt here and more words";
        let truncated = truncate_for_embedding(text, 3);
        assert!(text.starts_with(&truncated));
        assert!(truncated.len() <= 12);
    }

    #[test]
    fn test_gemini_rejects_invalid_dimension() {
        assert!(GeminiEmbedding::new("key".into(), 999).is_err());
        assert!(GeminiEmbedding::new("key".into(), 768).is_ok());
    }
}
