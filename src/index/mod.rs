//! Vector index abstraction.
//!
//! One collection with a fixed vector size and distance metric holds every
//! [`EmbeddingRecord`]. Implementations: a Qdrant-compatible REST client for
//! production and an in-memory index for tests and endpoint-less runs.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::acquire::ContentType;
use crate::config::{DistanceMetric, IndexConfig};
use crate::error::Result;
use crate::normalize::Chunk;

pub mod memory;
pub mod qdrant;

pub use memory::MemoryIndex;
pub use qdrant::QdrantIndex;

// ============================================================================
// Types
// ============================================================================

/// Declared shape of a collection. Implementations must reject operations
/// whose spec conflicts with what the collection was created with.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSpec {
    pub name: String,
    pub vector_size: usize,
    pub distance: DistanceMetric,
}

/// Searchable payload stored alongside each vector. Carries everything the
/// retriever and composer need so queries never re-fetch source documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPayload {
    /// Full chunk id. Stored in the payload because backends may restrict
    /// what a point id can look like.
    #[serde(default)]
    pub chunk_id: String,
    pub content: String,
    pub source_uri: String,
    pub content_type: ContentType,
    pub position: usize,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
}

/// One stored point: chunk id, vector, payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: ChunkPayload,
}

impl EmbeddingRecord {
    pub fn from_chunk(chunk: &Chunk, vector: Vec<f32>) -> Self {
        Self {
            id: chunk.id.clone(),
            vector,
            payload: ChunkPayload {
                chunk_id: chunk.id.clone(),
                content: chunk.content.clone(),
                source_uri: chunk.source_uri.clone(),
                content_type: chunk.content_type,
                position: chunk.position,
                language: chunk.language.clone(),
                summary: chunk.summary.clone(),
                tags: chunk.tags.clone(),
                acquired_at: chunk.acquired_at,
            },
        }
    }
}

/// A search hit with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub id: String,
    pub score: f32,
    pub payload: ChunkPayload,
}

// ============================================================================
// VectorIndex Trait
// ============================================================================

/// Storage seam for embedding vectors.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection if missing; verify its schema if present.
    /// A vector-size or metric conflict is [`crate::error::PipelineError::SchemaMismatch`].
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<()>;

    /// Upsert a batch of records. The batch becomes visible atomically:
    /// concurrent readers see all of it or none of it.
    async fn upsert_batch(&self, collection: &str, records: Vec<EmbeddingRecord>) -> Result<()>;

    /// Nearest-neighbor search returning up to `limit` scored records,
    /// highest score first.
    async fn search(&self, collection: &str, vector: &[f32], limit: usize)
        -> Result<Vec<ScoredRecord>>;

    /// Number of stored records.
    async fn count(&self, collection: &str) -> Result<usize>;

    /// Implementation name for logs and status output.
    fn name(&self) -> &'static str;
}

// ============================================================================
// Similarity
// ============================================================================

/// Cosine similarity between two vectors. Zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

// ============================================================================
// Factory Function
// ============================================================================

/// Build the configured index: a Qdrant client when an endpoint is set,
/// otherwise the in-memory index.
pub fn create_index(config: &IndexConfig) -> Result<std::sync::Arc<dyn VectorIndex>> {
    if config.endpoint.is_empty() {
        tracing::info!("no index endpoint configured, using in-memory index");
        Ok(std::sync::Arc::new(MemoryIndex::new()))
    } else {
        let index = QdrantIndex::new(config)?;
        tracing::info!(endpoint = %config.endpoint, "using qdrant index");
        Ok(std::sync::Arc::new(index))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_basic() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &c).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_degenerate() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_memory_index_selected_without_endpoint() {
        let config = IndexConfig::default();
        let index = create_index(&config).unwrap();
        assert_eq!(index.name(), "memory");
    }
}
