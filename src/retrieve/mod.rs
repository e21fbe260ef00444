//! Retrieval stage - a question becomes ranked passages.
//!
//! Hybrid scoring: the dense signal comes from vector search against the
//! index, the sparse signal from query-term overlap on the stored payload
//! text. `combined = vector_weight * dense + keyword_weight * sparse`, with a
//! hard `min_score` floor. Results below the floor are excluded entirely,
//! never padded back in.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::acquire::ContentType;
use crate::config::RetrieverConfig;
use crate::embed::EmbeddingProvider;
use crate::error::Result;
use crate::index::VectorIndex;

// ============================================================================
// Types
// ============================================================================

/// A passage selected for a query, with its score breakdown.
#[derive(Debug, Clone)]
pub struct RetrievedPassage {
    pub chunk_id: String,
    pub content: String,
    pub source_uri: String,
    pub content_type: ContentType,
    pub summary: Option<String>,
    pub tags: BTreeSet<String>,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
    pub vector_score: f32,
    pub keyword_score: f32,
    pub combined_score: f32,
}

/// Outcome of one retrieval. `limit_clamped` reports that the requested
/// limit exceeded the maximum and was silently reduced.
#[derive(Debug)]
pub struct Retrieval {
    pub passages: Vec<RetrievedPassage>,
    pub limit_clamped: bool,
}

// ============================================================================
// Retriever
// ============================================================================

/// Hybrid retriever over one collection.
pub struct Retriever {
    index: Arc<dyn VectorIndex>,
    provider: Arc<dyn EmbeddingProvider>,
    config: RetrieverConfig,
    collection: String,
}

impl Retriever {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        provider: Arc<dyn EmbeddingProvider>,
        config: RetrieverConfig,
        collection: String,
    ) -> Self {
        Self {
            index,
            provider,
            config,
            collection,
        }
    }

    /// Retrieve up to `limit` passages for `query` from the default
    /// collection, best first.
    ///
    /// `limit` defaults to the configured `default_limit` and is clamped to
    /// `max_limit`. An empty result is a valid outcome when nothing clears
    /// the score floor.
    pub async fn retrieve(&self, query: &str, limit: Option<usize>) -> Result<Retrieval> {
        let collection = self.collection.clone();
        self.retrieve_from(&collection, query, limit).await
    }

    /// Same as [`retrieve`](Self::retrieve) against a specific collection,
    /// for callers scoped to one repository context.
    pub async fn retrieve_from(
        &self,
        collection: &str,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Retrieval> {
        let requested = limit.unwrap_or(self.config.default_limit).max(1);
        let limit_clamped = requested > self.config.max_limit;
        let effective = requested.min(self.config.max_limit);

        let query_vector = self
            .provider
            .embed_batch(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        // Over-fetch so the keyword signal can promote candidates the dense
        // ranking alone would cut off.
        let candidate_limit = effective.saturating_mul(3).max(effective);
        let hits = self
            .index
            .search(collection, &query_vector, candidate_limit)
            .await?;

        let query_terms = query_terms(query);
        let mut passages: Vec<RetrievedPassage> = hits
            .into_iter()
            .map(|hit| {
                let vector_score = hit.score.clamp(0.0, 1.0);
                let keyword_score = keyword_overlap(&query_terms, &hit.payload.content);
                let combined_score = if self.config.use_hybrid_search {
                    self.config.vector_weight * vector_score
                        + self.config.keyword_weight * keyword_score
                } else {
                    vector_score
                };
                RetrievedPassage {
                    chunk_id: hit.id,
                    content: hit.payload.content,
                    source_uri: hit.payload.source_uri,
                    content_type: hit.payload.content_type,
                    summary: hit.payload.summary,
                    tags: hit.payload.tags,
                    acquired_at: hit.payload.acquired_at,
                    vector_score,
                    keyword_score,
                    combined_score,
                }
            })
            .filter(|p| p.combined_score >= self.config.min_score)
            .collect();

        // Best first; ties go to the more recently acquired passage.
        passages.sort_by(|a, b| {
            b.combined_score
                .partial_cmp(&a.combined_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.acquired_at.cmp(&a.acquired_at))
        });
        passages.truncate(effective);

        tracing::debug!(
            query_len = query.len(),
            results = passages.len(),
            limit_clamped,
            "retrieval complete"
        );
        Ok(Retrieval {
            passages,
            limit_clamped,
        })
    }
}

// ============================================================================
// Keyword Signal
// ============================================================================

/// Lowercased, deduplicated query terms of length > 1.
fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    query
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| w.len() > 1 && seen.insert(w.clone()))
        .collect()
}

/// Fraction of query terms present in the text, in [0, 1].
fn keyword_overlap(terms: &[String], text: &str) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let lower = text.to_lowercase();
    let hits = terms.iter().filter(|t| lower.contains(t.as_str())).count();
    hits as f32 / terms.len() as f32
}

// ============================================================================
// Tests
// ============================================================================
