//! In-memory vector index.
//!
//! Used when no endpoint is configured and as the test double behind the
//! [`VectorIndex`] seam. Batch upserts take the write lock once, so readers
//! observe each batch atomically.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::DistanceMetric;
use crate::error::{PipelineError, Result};

use super::{cosine_similarity, CollectionSpec, EmbeddingRecord, ScoredRecord, VectorIndex};

struct Collection {
    spec: CollectionSpec,
    records: HashMap<String, EmbeddingRecord>,
}

/// Process-local vector index.
pub struct MemoryIndex {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<()> {
        let mut collections = self.collections.write().await;
        match collections.get(&spec.name) {
            Some(existing) => {
                if existing.spec.vector_size != spec.vector_size
                    || existing.spec.distance != spec.distance
                {
                    return Err(PipelineError::schema(format!(
                        "collection '{}' exists with size {} / {}, requested {} / {}",
                        spec.name,
                        existing.spec.vector_size,
                        existing.spec.distance.as_str(),
                        spec.vector_size,
                        spec.distance.as_str()
                    )));
                }
                Ok(())
            }
            None => {
                collections.insert(
                    spec.name.clone(),
                    Collection {
                        spec: spec.clone(),
                        records: HashMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn upsert_batch(&self, collection: &str, records: Vec<EmbeddingRecord>) -> Result<()> {
        let mut collections = self.collections.write().await;
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| PipelineError::Index(format!("unknown collection '{collection}'")))?;

        for record in &records {
            if record.vector.len() != coll.spec.vector_size {
                return Err(PipelineError::schema(format!(
                    "record '{}' has vector size {}, collection '{}' expects {}",
                    record.id,
                    record.vector.len(),
                    collection,
                    coll.spec.vector_size
                )));
            }
        }
        // Validation above means the whole batch lands or none of it does.
        for record in records {
            coll.records.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredRecord>> {
        let collections = self.collections.read().await;
        let coll = collections
            .get(collection)
            .ok_or_else(|| PipelineError::Index(format!("unknown collection '{collection}'")))?;

        let mut scored: Vec<ScoredRecord> = coll
            .records
            .values()
            .map(|r| ScoredRecord {
                id: r.id.clone(),
                score: score_by_metric(coll.spec.distance, vector, &r.vector),
                payload: r.payload.clone(),
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|c| c.records.len())
            .unwrap_or(0))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Map each metric onto a higher-is-better score.
fn score_by_metric(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Cosine => cosine_similarity(a, b),
        DistanceMetric::Dot => a.iter().zip(b).map(|(x, y)| x * y).sum(),
        DistanceMetric::Euclid => {
            let d: f32 = a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt();
            1.0 / (1.0 + d)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
