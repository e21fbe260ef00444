//! repoqa - retrieval-augmented question answering for repository docs.
//!
//! An offline ingest flow (acquire, normalize, embed) and an online query
//! flow (retrieve, compose, answer) share one vector index.

pub mod acquire;
pub mod answer;
pub mod cli;
pub mod config;
pub mod context;
pub mod embed;
pub mod error;
pub mod index;
pub mod normalize;
pub mod pipeline;
pub mod retrieve;

// Re-exports
pub use acquire::{Acquisition, ContentType, Document, WebAcquirer};
pub use answer::{Answer, Answerer, GeminiGeneration, GenerationProvider, GenerationReply};
pub use config::{PipelineConfig, INSUFFICIENT_INFO_ANSWER};
pub use context::{AnswerContext, ContextComposer};
pub use embed::{get_api_key, has_api_key, Embedder, EmbeddingProvider, GeminiEmbedding};
pub use error::{ApiError, ApiErrorKind, PipelineError, Result};
pub use index::{create_index, EmbeddingRecord, MemoryIndex, QdrantIndex, VectorIndex};
pub use normalize::{Chunk, Normalizer};
pub use pipeline::{
    CancelFlag, IngestPipeline, IngestReport, QueryPipeline, QueryRequest, QueryResponse,
};
pub use retrieve::{RetrievedPassage, Retriever};
