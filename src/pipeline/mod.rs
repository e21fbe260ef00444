//! Pipeline orchestration.
//!
//! Two flows share one vector index: the offline ingest flow (acquire,
//! normalize, embed, upsert) and the online query flow (retrieve, compose,
//! answer). Stage order is fixed; a cancellation flag is checked between
//! stages, never inside one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::acquire::{Document, WebAcquirer};
use crate::answer::{Answer, Answerer, GenerationProvider};
use crate::config::PipelineConfig;
use crate::context::ContextComposer;
use crate::embed::{Embedder, EmbeddingProvider};
use crate::error::{ApiError, ApiErrorKind, PipelineError, Result};
use crate::index::{CollectionSpec, VectorIndex};
use crate::normalize::Normalizer;
use crate::retrieve::Retriever;

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation flag shared with the caller.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Ingest Flow
// ============================================================================

/// Per-run ingest accounting.
#[derive(Debug, Default, Serialize)]
pub struct IngestReport {
    pub pages_fetched: usize,
    pub pages_skipped: usize,
    pub chunks_produced: usize,
    pub chunks_dropped: usize,
    pub chunks_embedded: usize,
    pub embed_failures: usize,
    pub records_indexed: usize,
    pub index_failures: usize,
}

/// Offline flow: seed URI (or provided documents) into the vector index.
pub struct IngestPipeline {
    config: PipelineConfig,
    normalizer: Normalizer,
    embedder: Embedder,
    index: Arc<dyn VectorIndex>,
}

impl IngestPipeline {
    pub fn new(
        config: PipelineConfig,
        embedding_provider: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        let normalizer = Normalizer::new(config.normalizer.clone());
        let embedder = Embedder::new(embedding_provider, config.embedder.clone());
        Self {
            config,
            normalizer,
            embedder,
            index,
        }
    }

    /// Ingest starting from a seed URI.
    pub async fn run(&self, seed_uri: &str, cancel: &CancelFlag) -> Result<IngestReport> {
        cancel.check()?;
        let acquirer = WebAcquirer::new(self.config.acquirer.clone())?;
        let acquisition = acquirer.acquire(seed_uri).await?;

        let mut report = IngestReport {
            pages_fetched: acquisition.documents.len(),
            pages_skipped: acquisition.skipped.len(),
            ..Default::default()
        };
        self.ingest_documents(acquisition.documents, cancel, &mut report)
            .await?;
        Ok(report)
    }

    /// Ingest already-provided documents, bypassing acquisition.
    pub async fn run_documents(
        &self,
        documents: Vec<Document>,
        cancel: &CancelFlag,
    ) -> Result<IngestReport> {
        let mut report = IngestReport {
            pages_fetched: documents.len(),
            ..Default::default()
        };
        self.ingest_documents(documents, cancel, &mut report)
            .await?;
        Ok(report)
    }

    async fn ingest_documents(
        &self,
        documents: Vec<Document>,
        cancel: &CancelFlag,
        report: &mut IngestReport,
    ) -> Result<()> {
        cancel.check()?;
        self.index
            .ensure_collection(&CollectionSpec {
                name: self.config.embedder.collection.clone(),
                vector_size: self.config.embedder.vector_size,
                distance: self.config.embedder.distance_metric,
            })
            .await?;

        cancel.check()?;
        let normalization = self.normalizer.normalize_all(&documents);
        report.chunks_produced = normalization.chunks.len();
        report.chunks_dropped =
            normalization.dropped_undersized + normalization.dropped_oversized;

        cancel.check()?;
        let outcome = self.embedder.embed_chunks(&normalization.chunks).await?;
        report.chunks_embedded = outcome.records.len();
        report.embed_failures = outcome.failed.len();

        cancel.check()?;
        for batch in outcome.records.chunks(self.config.embedder.batch_size.max(1)) {
            match self
                .index
                .upsert_batch(&self.config.embedder.collection, batch.to_vec())
                .await
            {
                Ok(()) => report.records_indexed += batch.len(),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    // Degraded ingestion: the batch is lost, the run goes on.
                    tracing::warn!(error = %e, size = batch.len(), "index upsert failed, batch dropped");
                    report.index_failures += batch.len();
                }
            }
        }

        tracing::info!(
            indexed = report.records_indexed,
            embed_failures = report.embed_failures,
            index_failures = report.index_failures,
            "ingest complete"
        );
        Ok(())
    }
}

// ============================================================================
// Query Flow
// ============================================================================

/// Consumer-facing query request. `repository_context_id` scopes the query
/// to one repository's collection; when absent, the configured default
/// collection is used.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub repository_context_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// A source that grounded the answer.
#[derive(Debug, Clone, Serialize)]
pub struct CitedSource {
    pub index: usize,
    pub chunk_id: String,
    pub uri: String,
    pub score: f32,
}

/// Consumer-facing query response.
#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<CitedSource>,
    pub confidence: f32,
    pub fallback_used: bool,
    /// True when the requested limit exceeded the maximum and was reduced.
    pub limit_clamped: bool,
}

/// Online flow: question in, grounded answer out.
pub struct QueryPipeline {
    retriever: Retriever,
    composer: ContextComposer,
    answerer: Answerer,
    default_collection: String,
}

impl QueryPipeline {
    pub fn new(
        config: PipelineConfig,
        embedding_provider: Arc<dyn EmbeddingProvider>,
        generation_provider: Arc<dyn GenerationProvider>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        let retriever = Retriever::new(
            index,
            embedding_provider,
            config.retriever.clone(),
            config.embedder.collection.clone(),
        );
        let composer = ContextComposer::new(config.composer.clone());
        let answerer = Answerer::new(generation_provider, config.answerer.clone());
        Self {
            retriever,
            composer,
            answerer,
            default_collection: config.embedder.collection.clone(),
        }
    }

    /// Answer one question. Errors use the stable [`ApiError`] vocabulary.
    pub async fn ask(
        &self,
        request: &QueryRequest,
        cancel: &CancelFlag,
    ) -> std::result::Result<QueryResponse, ApiError> {
        if request.question.trim().is_empty() {
            return Err(ApiError::new(
                ApiErrorKind::InvalidRequest,
                "question must not be empty",
            ));
        }

        let result = self.ask_inner(request, cancel).await;
        result.map_err(|e| ApiError::from(&e))
    }

    async fn ask_inner(
        &self,
        request: &QueryRequest,
        cancel: &CancelFlag,
    ) -> Result<QueryResponse> {
        cancel.check()?;
        let collection = request
            .repository_context_id
            .as_deref()
            .unwrap_or(&self.default_collection);
        let retrieval = self
            .retriever
            .retrieve_from(collection, &request.question, request.limit)
            .await?;

        cancel.check()?;
        let context = self.composer.compose(&request.question, &retrieval.passages);
        let prompt = self.composer.render(&context);

        cancel.check()?;
        let answer = self.answerer.answer(&context, &prompt).await?;

        Ok(QueryResponse {
            sources: context
                .sources
                .iter()
                .map(|s| CitedSource {
                    index: s.index,
                    chunk_id: s.chunk_id.clone(),
                    uri: s.source_uri.clone(),
                    score: s.score,
                })
                .collect(),
            answer: answer.text,
            confidence: answer.confidence,
            fallback_used: answer.fallback_used,
            limit_clamped: retrieval.limit_clamped,
        })
    }

    /// Direct access to the composed answer record, for callers that want
    /// the full [`Answer`] rather than the API response shape.
    pub async fn answer(&self, question: &str, limit: Option<usize>) -> Result<Answer> {
        let retrieval = self.retriever.retrieve(question, limit).await?;
        let context = self.composer.compose(question, &retrieval.passages);
        let prompt = self.composer.render(&context);
        self.answerer.answer(&context, &prompt).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::ContentType;
    use crate::answer::GenerationReply;
    use crate::index::MemoryIndex;
    use async_trait::async_trait;

    /// Length-insensitive fake embeddings keyed on topic words, mirroring
    /// the retriever tests.
    struct TopicProvider;

    fn topic_vector(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let mut v = vec![0.0f32; 4];
        if lower.contains("auth") {
            v[0] = 1.0;
        }
        if lower.contains("deploy") {
            v[1] = 1.0;
        }
        if v.iter().all(|x| *x == 0.0) {
            v[3] = 1.0;
        }
        v
    }

    #[async_trait]
    impl EmbeddingProvider for TopicProvider {
        async fn embed_batch(
            &self,
            texts: &[String],
        ) -> crate::error::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| topic_vector(t)).collect())
        }

        fn dimension(&self) -> usize {
            4
        }

        fn name(&self) -> &str {
            "topic"
        }
    }

    /// Always answers with a citation of source 1.
    struct CitingProvider;

    #[async_trait]
    impl GenerationProvider for CitingProvider {
        async fn generate(&self, _prompt: &str) -> crate::error::Result<GenerationReply> {
            Ok(GenerationReply::Answer {
                text: "Auth tokens rotate hourly [1].".into(),
                avg_logprobs: Some(-0.05),
            })
        }

        fn model(&self) -> &str {
            "citing"
        }
    }

    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.embedder.vector_size = 4;
        config.normalizer.min_content_length = 10;
        config
    }

    fn docs() -> Vec<Document> {
        vec![
            Document::from_text(
                "https://docs.example.dev/auth",
                "Auth tokens rotate hourly and must be refreshed by the client.".into(),
                ContentType::Html,
            ),
            Document::from_text(
                "https://docs.example.dev/deploy",
                "Deploy with the release script after the tests pass.".into(),
                ContentType::Html,
            ),
        ]
    }

    // End to end: ingest two documents, ask a question, get an answer
    // grounded in the relevant one.
    #[tokio::test]
    async fn test_ingest_then_query_end_to_end() {
        let config = test_config();
        let index: Arc<MemoryIndex> = Arc::new(MemoryIndex::new());
        let embedding: Arc<dyn EmbeddingProvider> = Arc::new(TopicProvider);

        let ingest = IngestPipeline::new(config.clone(), embedding.clone(), index.clone());
        let cancel = CancelFlag::new();
        let report = ingest.run_documents(docs(), &cancel).await.unwrap();
        assert_eq!(report.pages_fetched, 2);
        assert_eq!(report.records_indexed, 2);
        assert_eq!(report.embed_failures, 0);

        let query = QueryPipeline::new(config, embedding, Arc::new(CitingProvider), index);
        let request = QueryRequest {
            question: "how do auth tokens work?".into(),
            repository_context_id: None,
            limit: None,
        };
        let response = query.ask(&request, &cancel).await.unwrap();

        assert!(response.answer.contains("[1]"));
        assert!(!response.fallback_used);
        assert!(!response.sources.is_empty());
        assert!(response.sources[0].uri.contains("/auth"));
        assert!(response.confidence > 0.9);
        assert!(!response.limit_clamped);
    }

    #[tokio::test]
    async fn test_empty_question_is_invalid_request() {
        let config = test_config();
        let index: Arc<MemoryIndex> = Arc::new(MemoryIndex::new());
        let query = QueryPipeline::new(
            config,
            Arc::new(TopicProvider),
            Arc::new(CitingProvider),
            index,
        );
        let request = QueryRequest {
            question: "   ".into(),
            repository_context_id: None,
            limit: None,
        };
        let err = query.ask(&request, &CancelFlag::new()).await.unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_no_relevant_sources_yields_fallback() {
        let config = test_config();
        let index: Arc<MemoryIndex> = Arc::new(MemoryIndex::new());
        let embedding: Arc<dyn EmbeddingProvider> = Arc::new(TopicProvider);

        let ingest = IngestPipeline::new(config.clone(), embedding.clone(), index.clone());
        ingest
            .run_documents(docs(), &CancelFlag::new())
            .await
            .unwrap();

        let query = QueryPipeline::new(config, embedding, Arc::new(CitingProvider), index);
        let request = QueryRequest {
            // Off-topic question: embeds to the catch-all axis, no overlap.
            question: "what color is the sky".into(),
            repository_context_id: None,
            limit: None,
        };
        let response = query.ask(&request, &CancelFlag::new()).await.unwrap();
        assert!(response.fallback_used);
        assert!(response.sources.is_empty());
        assert_eq!(response.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_cancellation_stops_between_stages() {
        let config = test_config();
        let index: Arc<MemoryIndex> = Arc::new(MemoryIndex::new());
        let ingest = IngestPipeline::new(config, Arc::new(TopicProvider), index.clone());

        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = ingest.run_documents(docs(), &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        // Nothing reached the index.
        assert_eq!(index.count("repoqa").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reingesting_same_content_does_not_duplicate() {
        let config = test_config();
        let index: Arc<MemoryIndex> = Arc::new(MemoryIndex::new());
        let ingest = IngestPipeline::new(config, Arc::new(TopicProvider), index.clone());

        let cancel = CancelFlag::new();
        ingest.run_documents(docs(), &cancel).await.unwrap();
        ingest.run_documents(docs(), &cancel).await.unwrap();
        // Deterministic chunk ids make the second run an overwrite.
        assert_eq!(index.count("repoqa").await.unwrap(), 2);
    }
}
