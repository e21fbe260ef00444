//! Pipeline error taxonomy.
//!
//! Recoverable failures are absorbed at stage boundaries and converted into
//! degraded results; only the variants below cross stage boundaries. The
//! consumer-facing API maps them onto a small stable vocabulary so raw
//! provider/index error text never leaks to callers.

use serde::Serialize;

// ============================================================================
// PipelineError
// ============================================================================

/// Top-level error type for all pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// The acquisition seed URI could not be fetched after all retries.
    #[error("seed unreachable: {uri}: {message}")]
    SeedUnreachable { uri: String, message: String },

    /// Vector size or distance metric conflicts with the declared collection.
    #[error("collection schema mismatch: {message}")]
    SchemaMismatch { message: String },

    /// Transient index I/O failure that survived the retry budget.
    #[error("index error: {0}")]
    Index(String),

    /// The generation provider blocked the response on safety grounds.
    /// Never retried.
    #[error("generation blocked by safety filter: {category}")]
    SafetyBlocked { category: String },

    /// Transient generation failure that survived the retry budget.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// Authentication or malformed-request failure. Not retried.
    #[error("provider auth/config failure: {0}")]
    Auth(String),

    /// Network/HTTP error outside the retrying paths.
    #[error("network error: {0}")]
    Network(String),

    /// The run was cancelled between stages.
    #[error("operation cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a schema mismatch error from any displayable message.
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            message: msg.into(),
        }
    }

    /// True for errors the caller cannot recover from by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::SeedUnreachable { .. }
                | Self::SchemaMismatch { .. }
                | Self::Auth(_)
        )
    }
}

// ============================================================================
// API error vocabulary
// ============================================================================

/// Stable machine-readable error kinds exposed by the query API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    InvalidRequest,
    IndexUnavailable,
    GenerationBlocked,
    GenerationFailed,
    Configuration,
}

/// Structured error returned by the consumer-facing query API.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&PipelineError> for ApiError {
    fn from(err: &PipelineError) -> Self {
        match err {
            PipelineError::Config { .. } | PipelineError::Auth(_) => Self::new(
                ApiErrorKind::Configuration,
                "pipeline configuration or credentials are invalid",
            ),
            PipelineError::SchemaMismatch { .. } => Self::new(
                ApiErrorKind::Configuration,
                "vector collection schema does not match configuration",
            ),
            PipelineError::Index(_) => {
                Self::new(ApiErrorKind::IndexUnavailable, "vector index unavailable")
            }
            PipelineError::SafetyBlocked { .. } => Self::new(
                ApiErrorKind::GenerationBlocked,
                "the answer was blocked by the safety filter",
            ),
            PipelineError::GenerationFailed(_) | PipelineError::Network(_) => Self::new(
                ApiErrorKind::GenerationFailed,
                "answer generation failed after retries",
            ),
            PipelineError::SeedUnreachable { uri, .. } => Self::new(
                ApiErrorKind::InvalidRequest,
                format!("source {uri} is unreachable"),
            ),
            PipelineError::Cancelled => {
                Self::new(ApiErrorKind::InvalidRequest, "the request was cancelled")
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
