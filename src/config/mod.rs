//! Pipeline configuration.
//!
//! One immutable [`PipelineConfig`] is loaded per run (`~/.repoqa/repoqa.toml`
//! by default) and passed by reference into each stage. Every stage section
//! has named, validated fields with serde defaults; no stage mutates shared
//! config.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "repoqa.toml";

/// Fixed fallback answer used when confidence falls below the threshold.
pub const INSUFFICIENT_INFO_ANSWER: &str =
    "I don't have enough information to answer this question";

// ============================================================================
// Data Directory
// ============================================================================

/// Data/config directory path (~/.repoqa/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".repoqa")
}

// ============================================================================
// Stage Configs
// ============================================================================

/// `[acquirer]` - content acquisition policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquirerConfig {
    /// Total fetched pages per run.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Link depth from the seed URI.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Restrict link following to the seed's domain.
    #[serde(default = "default_true")]
    pub follow_same_domain: bool,
    /// CSS selectors whose matches are kept (intersection).
    #[serde(default = "default_content_selectors")]
    pub content_selectors: Vec<String>,
    /// CSS selectors removed after inclusion (nav, ads, comments).
    #[serde(default = "default_exclude_selectors")]
    pub exclude_selectors: Vec<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Per-page retry budget.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff between page retries, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// User-Agent header sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Bounded worker count for parallel page fetches.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for AcquirerConfig {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            max_depth: default_max_depth(),
            follow_same_domain: true,
            content_selectors: default_content_selectors(),
            exclude_selectors: default_exclude_selectors(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            user_agent: default_user_agent(),
            concurrency: default_concurrency(),
        }
    }
}

impl AcquirerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_pages == 0 {
            return Err(PipelineError::config("acquirer.max_pages must be > 0"));
        }
        if self.concurrency == 0 {
            return Err(PipelineError::config("acquirer.concurrency must be > 0"));
        }
        if self.timeout_secs == 0 {
            return Err(PipelineError::config("acquirer.timeout_secs must be > 0"));
        }
        Ok(())
    }
}

/// `[normalizer]` - cleaning, length bounds, enrichment flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizerConfig {
    #[serde(default = "default_true")]
    pub remove_html: bool,
    #[serde(default)]
    pub remove_urls: bool,
    #[serde(default)]
    pub remove_emails: bool,
    #[serde(default)]
    pub remove_phone_numbers: bool,
    #[serde(default = "default_true")]
    pub normalize_whitespace: bool,
    /// Chunks shorter than this are dropped, not padded.
    #[serde(default = "default_min_content_length")]
    pub min_content_length: usize,
    /// Content longer than this is split at paragraph boundaries.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,
    #[serde(default = "default_true")]
    pub detect_language: bool,
    #[serde(default = "default_true")]
    pub generate_summary: bool,
    #[serde(default = "default_summary_max_length")]
    pub summary_max_length: usize,
    #[serde(default = "default_true")]
    pub extract_tags: bool,
    /// Vocabulary matched by keyword presence to produce chunk tags.
    #[serde(default = "default_common_tags")]
    pub common_tags: Vec<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            remove_html: true,
            remove_urls: false,
            remove_emails: false,
            remove_phone_numbers: false,
            normalize_whitespace: true,
            min_content_length: default_min_content_length(),
            max_content_length: default_max_content_length(),
            detect_language: true,
            generate_summary: true,
            summary_max_length: default_summary_max_length(),
            extract_tags: true,
            common_tags: default_common_tags(),
        }
    }
}

impl NormalizerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_content_length >= self.max_content_length {
            return Err(PipelineError::config(
                "normalizer.min_content_length must be < max_content_length",
            ));
        }
        if self.summary_max_length == 0 {
            return Err(PipelineError::config(
                "normalizer.summary_max_length must be > 0",
            ));
        }
        Ok(())
    }
}

/// `[embedder]` - vectorization and collection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedderConfig {
    /// Target collection name in the vector index.
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Fixed vector dimensionality for the collection.
    #[serde(default = "default_vector_size")]
    pub vector_size: usize,
    /// Distance metric declared on the collection.
    #[serde(default)]
    pub distance_metric: DistanceMetric,
    /// Chunks are embedded and upserted in batches of this size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Token-equivalent cap; longer text is truncated at a token boundary.
    #[serde(default = "default_embed_max_length")]
    pub max_length: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// L2-normalize vectors before upsert.
    #[serde(default = "default_true")]
    pub normalize_embeddings: bool,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            collection: default_collection(),
            vector_size: default_vector_size(),
            distance_metric: DistanceMetric::default(),
            batch_size: default_batch_size(),
            max_length: default_embed_max_length(),
            max_retries: default_max_retries(),
            normalize_embeddings: true,
        }
    }
}

impl EmbedderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vector_size == 0 {
            return Err(PipelineError::config("embedder.vector_size must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::config("embedder.batch_size must be > 0"));
        }
        Ok(())
    }
}

/// Distance metric for a vector collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclid,
    Dot,
}

impl DistanceMetric {
    /// Wire name understood by the Qdrant REST API.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "Cosine",
            Self::Euclid => "Euclid",
            Self::Dot => "Dot",
        }
    }
}

/// `[retriever]` - hybrid search weights and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieverConfig {
    #[serde(default = "default_true")]
    pub use_hybrid_search: bool,
    /// Dense similarity weight; keyword weight is `1 - vector_weight`.
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f32,
    /// Passages scoring below this floor are excluded entirely.
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    /// Requests above this are silently clamped, not rejected.
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            use_hybrid_search: true,
            vector_weight: default_vector_weight(),
            keyword_weight: default_keyword_weight(),
            min_score: default_min_score(),
            default_limit: default_limit(),
            max_limit: default_max_limit(),
        }
    }
}

impl RetrieverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.use_hybrid_search {
            let sum = self.vector_weight + self.keyword_weight;
            if (sum - 1.0).abs() > 1e-6 {
                return Err(PipelineError::config(format!(
                    "retriever.vector_weight + keyword_weight must equal 1.0 (got {sum})"
                )));
            }
            if self.vector_weight < 0.0 || self.keyword_weight < 0.0 {
                return Err(PipelineError::config(
                    "retriever weights must be non-negative",
                ));
            }
        }
        if self.default_limit == 0 || self.default_limit > self.max_limit {
            return Err(PipelineError::config(
                "retriever.default_limit must be in 1..=max_limit",
            ));
        }
        Ok(())
    }
}

/// `[composer]` - context assembly settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposerConfig {
    /// Upper bound on selected sources.
    #[serde(default = "default_max_sources")]
    pub max_sources: usize,
    /// Token-estimated cap on total rendered context.
    #[serde(default = "default_max_context_length")]
    pub max_context_length: usize,
    #[serde(default = "default_true")]
    pub include_citations: bool,
    /// Per-source template; `{index}`, `{content}`, `{source_type}`.
    #[serde(default = "default_context_format")]
    pub context_format: String,
    /// Citation label template; `{index}`, `{uri}`.
    #[serde(default = "default_citation_format")]
    pub citation_format: String,
    /// System prompt template; `{sources}`, `{question}`.
    #[serde(default = "default_system_prompt_template")]
    pub system_prompt_template: String,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            max_sources: default_max_sources(),
            max_context_length: default_max_context_length(),
            include_citations: true,
            context_format: default_context_format(),
            citation_format: default_citation_format(),
            system_prompt_template: default_system_prompt_template(),
        }
    }
}

impl ComposerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_sources == 0 {
            return Err(PipelineError::config("composer.max_sources must be > 0"));
        }
        if !self.system_prompt_template.contains("{sources}")
            || !self.system_prompt_template.contains("{question}")
        {
            return Err(PipelineError::config(
                "composer.system_prompt_template must contain {sources} and {question}",
            ));
        }
        Ok(())
    }
}

/// A single safety rule: named harm category mapped to a block threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetySetting {
    pub category: String,
    pub threshold: String,
}

/// `[answerer]` - generation parameters and confidence gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswererConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_safety_settings")]
    pub safety_settings: Vec<SafetySetting>,
    /// Retry transient provider errors (timeouts, 5xx, 429).
    #[serde(default = "default_true")]
    pub retry_on_error: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Below this, the fixed insufficient-information answer is returned.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AnswererConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            safety_settings: default_safety_settings(),
            retry_on_error: true,
            max_retries: default_max_retries(),
            confidence_threshold: default_confidence_threshold(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl AnswererConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(PipelineError::config(
                "answerer.confidence_threshold must be in [0, 1]",
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(PipelineError::config(
                "answerer.temperature must be in [0, 2]",
            ));
        }
        if self.max_tokens == 0 {
            return Err(PipelineError::config("answerer.max_tokens must be > 0"));
        }
        Ok(())
    }
}

/// `[index]` - vector index service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Qdrant-compatible REST endpoint; empty selects the in-memory index.
    #[serde(default)]
    pub endpoint: String,
    /// Env var holding the index API key (never the key itself).
    #[serde(default = "default_index_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key_env: default_index_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

// ============================================================================
// PipelineConfig
// ============================================================================

/// Top-level pipeline configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub acquirer: AcquirerConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub embedder: EmbedderConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retriever: RetrieverConfig,
    #[serde(default)]
    pub composer: ComposerConfig,
    #[serde(default)]
    pub answerer: AnswererConfig,
}

impl PipelineConfig {
    /// Validate every stage section. Called once at load time.
    pub fn validate(&self) -> Result<()> {
        self.acquirer.validate()?;
        self.normalizer.validate()?;
        self.embedder.validate()?;
        self.retriever.validate()?;
        self.composer.validate()?;
        self.answerer.validate()?;
        Ok(())
    }
}

/// Path to the config file (~/.repoqa/repoqa.toml).
pub fn config_file_path() -> PathBuf {
    get_data_dir().join(CONFIG_FILE_NAME)
}

/// Load the pipeline config from the default location.
/// Returns validated defaults if the file does not exist.
pub fn load_config() -> Result<PipelineConfig> {
    let path = config_file_path();
    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        let config = PipelineConfig::default();
        config.validate()?;
        return Ok(config);
    }
    load_config_from(&path)
}

/// Load the pipeline config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::config(format!("failed to read {}: {e}", path.display())))?;

    let config: PipelineConfig = toml::from_str(&content)
        .map_err(|e| PipelineError::config(format!("failed to parse {}: {e}", path.display())))?;

    config.validate()?;
    Ok(config)
}

/// Create the data directory and write a default config file.
pub fn init_config() -> Result<PathBuf> {
    let dir = get_data_dir();
    std::fs::create_dir_all(&dir)
        .map_err(|e| PipelineError::config(format!("failed to create {}: {e}", dir.display())))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let content = toml::to_string_pretty(&PipelineConfig::default())
        .map_err(|e| PipelineError::config(e.to_string()))?;
    std::fs::write(&path, content)
        .map_err(|e| PipelineError::config(format!("failed to write {}: {e}", path.display())))?;

    tracing::info!(?path, "created default config file");
    Ok(path)
}

// ============================================================================
// Defaults
// ============================================================================

fn default_true() -> bool {
    true
}
fn default_max_pages() -> usize {
    50
}
fn default_max_depth() -> usize {
    2
}
fn default_content_selectors() -> Vec<String> {
    vec![
        "article".into(),
        "main".into(),
        "[role=main]".into(),
        ".content".into(),
        "#content".into(),
    ]
}
fn default_exclude_selectors() -> Vec<String> {
    vec![
        "nav".into(),
        "header".into(),
        "footer".into(),
        "aside".into(),
        ".comments".into(),
        ".advertisement".into(),
    ]
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    500
}
fn default_user_agent() -> String {
    concat!("repoqa/", env!("CARGO_PKG_VERSION")).into()
}
fn default_concurrency() -> usize {
    4
}
fn default_min_content_length() -> usize {
    50
}
fn default_max_content_length() -> usize {
    2000
}
fn default_summary_max_length() -> usize {
    200
}
fn default_common_tags() -> Vec<String> {
    vec![
        "api".into(),
        "authentication".into(),
        "configuration".into(),
        "deployment".into(),
        "testing".into(),
        "database".into(),
        "security".into(),
    ]
}
fn default_collection() -> String {
    "repoqa".into()
}
fn default_vector_size() -> usize {
    768
}
fn default_batch_size() -> usize {
    32
}
fn default_embed_max_length() -> usize {
    512
}
fn default_vector_weight() -> f32 {
    0.7
}
fn default_keyword_weight() -> f32 {
    0.3
}
fn default_min_score() -> f32 {
    0.3
}
fn default_limit() -> usize {
    5
}
fn default_max_limit() -> usize {
    20
}
fn default_max_sources() -> usize {
    5
}
fn default_max_context_length() -> usize {
    3000
}
fn default_context_format() -> String {
    "[{index}] ({source_type}) {content}".into()
}
fn default_citation_format() -> String {
    "[{index}] {uri}".into()
}
fn default_system_prompt_template() -> String {
    "You are a repository assistant. Answer the question using only the \
     sources below. Cite sources by their [index] markers.\n\n\
     Sources:\n{sources}\n\nQuestion: {question}"
        .into()
}
fn default_model() -> String {
    "gemini-2.0-flash".into()
}
fn default_max_tokens() -> usize {
    1024
}
fn default_temperature() -> f32 {
    0.2
}
fn default_top_p() -> f32 {
    0.95
}
fn default_top_k() -> usize {
    40
}
fn default_safety_settings() -> Vec<SafetySetting> {
    [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
    ]
    .iter()
    .map(|c| SafetySetting {
        category: (*c).to_string(),
        threshold: "BLOCK_MEDIUM_AND_ABOVE".into(),
    })
    .collect()
}
fn default_confidence_threshold() -> f32 {
    0.4
}
fn default_index_api_key_env() -> String {
    "QDRANT_API_KEY".into()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_roundtrip() {
        let config = PipelineConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: PipelineConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.embedder.vector_size, 768);
        assert_eq!(parsed.retriever.default_limit, 5);
        assert_eq!(parsed.answerer.safety_settings.len(), 4);
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = PipelineConfig::default();
        config.retriever.vector_weight = 0.8;
        config.retriever.keyword_weight = 0.3;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must equal 1.0"));
    }

    #[test]
    fn test_weights_not_checked_when_hybrid_disabled() {
        let mut config = PipelineConfig::default();
        config.retriever.use_hybrid_search = false;
        config.retriever.vector_weight = 1.0;
        config.retriever.keyword_weight = 0.5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_length_bounds_ordering() {
        let mut config = PipelineConfig::default();
        config.normalizer.min_content_length = 2000;
        config.normalizer.max_content_length = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_prompt_template_placeholders_required() {
        let mut config = PipelineConfig::default();
        config.composer.system_prompt_template = "no placeholders here".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("repoqa.toml");
        std::fs::write(
            &path,
            r#"
[acquirer]
max_pages = 10
max_depth = 1

[retriever]
vector_weight = 0.6
keyword_weight = 0.4
"#,
        )
        .unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.acquirer.max_pages, 10);
        assert_eq!(config.retriever.vector_weight, 0.6);
        // Untouched sections keep defaults
        assert_eq!(config.embedder.batch_size, 32);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("repoqa.toml");
        std::fs::write(&path, "[acquirer]\nmax_pages = 0\n").unwrap();
        assert!(load_config_from(&path).is_err());
    }

    #[test]
    fn test_distance_metric_wire_names() {
        assert_eq!(DistanceMetric::Cosine.as_str(), "Cosine");
        assert_eq!(DistanceMetric::Euclid.as_str(), "Euclid");
        assert_eq!(DistanceMetric::Dot.as_str(), "Dot");
    }
}
