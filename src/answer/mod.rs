//! Answer generation - a composed context becomes a grounded answer.
//!
//! The provider trait fronts the LLM API. The [`Answerer`] adds transient
//! retry with jittered backoff, keeps safety blocks strictly separate from
//! failures (a block is a provider decision and is never retried), scores
//! answer confidence, and substitutes the fixed insufficient-information
//! text when confidence falls below the configured threshold.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{AnswererConfig, SafetySetting, INSUFFICIENT_INFO_ANSWER};
use crate::context::AnswerContext;
use crate::error::{PipelineError, Result};

// ============================================================================
// Types
// ============================================================================

/// What the provider produced for one prompt.
#[derive(Debug, Clone)]
pub enum GenerationReply {
    /// A completed generation, with the provider's average log-probability
    /// when it exposes one.
    Answer {
        text: String,
        avg_logprobs: Option<f64>,
    },
    /// The provider refused on safety grounds. Not an error and not
    /// retryable.
    Blocked { category: String },
}

/// The final answer returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<String>,
    pub confidence: f32,
    /// True when the fixed insufficient-information text replaced the
    /// generated answer.
    pub fallback_used: bool,
    pub model: String,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

// ============================================================================
// GenerationProvider Trait
// ============================================================================

/// Interface to a text-generation backend.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Generate a reply for one prompt. Transient transport problems are
    /// errors; a safety refusal is a successful [`GenerationReply::Blocked`].
    async fn generate(&self, prompt: &str) -> Result<GenerationReply>;

    /// Model name for logs and the answer record.
    fn model(&self) -> &str;
}

// ============================================================================
// Google Gemini Generation
// ============================================================================

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Gemini generateContent client.
pub struct GeminiGeneration {
    api_key: String,
    client: reqwest::Client,
    config: AnswererConfig,
}

impl GeminiGeneration {
    pub fn new(api_key: String, config: AnswererConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            api_key,
            client,
            config,
        })
    }

    /// Read the API key from `GEMINI_API_KEY` / `GOOGLE_AI_API_KEY`.
    pub fn from_env(config: AnswererConfig) -> Result<Self> {
        Self::new(crate::embed::get_api_key()?, config)
    }

    fn url(&self) -> String {
        format!("{GEMINI_BASE_URL}/{}:generateContent", self.config.model)
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
    #[serde(rename = "safetySettings")]
    safety_settings: &'a [SafetySetting],
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "topP")]
    top_p: f32,
    #[serde(rename = "topK")]
    top_k: usize,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "finishReason", default)]
    finish_reason: String,
    #[serde(rename = "safetyRatings", default)]
    safety_ratings: Vec<SafetyRating>,
    #[serde(rename = "avgLogprobs")]
    avg_logprobs: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct SafetyRating {
    category: String,
    #[serde(default)]
    blocked: bool,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[async_trait]
impl GenerationProvider for GeminiGeneration {
    async fn generate(&self, prompt: &str) -> Result<GenerationReply> {
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                top_p: self.config.top_p,
                top_k: self.config.top_k,
                max_output_tokens: self.config.max_tokens,
            },
            safety_settings: &self.config.safety_settings,
        };

        let response = self
            .client
            .post(self.url())
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::GenerationFailed(format!("request failed: {e}")))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        match status.as_u16() {
            200..=299 => {}
            401 | 403 => {
                return Err(PipelineError::Auth(format!(
                    "generation API rejected credentials: HTTP {status}"
                )))
            }
            _ => {
                return Err(PipelineError::GenerationFailed(format!(
                    "HTTP {status}: {body}"
                )))
            }
        }

        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| PipelineError::GenerationFailed(format!("bad response: {e}")))?;

        // Prompt-level block.
        if let Some(feedback) = &parsed.prompt_feedback {
            if let Some(reason) = &feedback.block_reason {
                return Ok(GenerationReply::Blocked {
                    category: reason.clone(),
                });
            }
        }

        let Some(candidate) = parsed.candidates.into_iter().next() else {
            return Err(PipelineError::GenerationFailed(
                "response carried no candidates".into(),
            ));
        };

        // Candidate-level safety stop.
        if candidate.finish_reason == "SAFETY" {
            let category = candidate
                .safety_ratings
                .iter()
                .find(|r| r.blocked)
                .map(|r| r.category.clone())
                .unwrap_or_else(|| "UNSPECIFIED".to_string());
            return Ok(GenerationReply::Blocked { category });
        }

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().map(|p| p.text).collect::<Vec<_>>().join(""))
            .unwrap_or_default();
        if text.is_empty() {
            return Err(PipelineError::GenerationFailed(
                "response carried no text".into(),
            ));
        }

        Ok(GenerationReply::Answer {
            text,
            avg_logprobs: candidate.avg_logprobs,
        })
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

// ============================================================================
// Answerer
// ============================================================================

/// Initial backoff between generation retries (ms).
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Generation stage: drives a [`GenerationProvider`] with retry, confidence
/// scoring and the fallback gate.
pub struct Answerer {
    provider: Arc<dyn GenerationProvider>,
    config: AnswererConfig,
}

impl Answerer {
    pub fn new(provider: Arc<dyn GenerationProvider>, config: AnswererConfig) -> Self {
        Self { provider, config }
    }

    /// Produce an answer for a composed context.
    ///
    /// An empty context short-circuits to the fallback text without calling
    /// the provider. A safety block surfaces as
    /// [`PipelineError::SafetyBlocked`] and is never retried; transient
    /// failures are retried with jittered exponential backoff up to
    /// `max_retries`.
    pub async fn answer(&self, context: &AnswerContext, prompt: &str) -> Result<Answer> {
        if context.is_empty() {
            tracing::debug!("no sources in context, returning fallback without generation");
            return Ok(self.fallback_answer(context, 0.0));
        }

        let reply = self.generate_with_retry(prompt).await?;

        let (text, avg_logprobs) = match reply {
            GenerationReply::Blocked { category } => {
                tracing::warn!(%category, "generation blocked by safety filter");
                return Err(PipelineError::SafetyBlocked { category });
            }
            GenerationReply::Answer { text, avg_logprobs } => (text, avg_logprobs),
        };

        let confidence = score_confidence(&text, context, avg_logprobs);
        if confidence < self.config.confidence_threshold {
            tracing::info!(
                confidence,
                threshold = self.config.confidence_threshold,
                "confidence below threshold, substituting fallback answer"
            );
            return Ok(self.fallback_answer(context, confidence));
        }

        Ok(Answer {
            text,
            citations: context.citations.clone(),
            confidence,
            fallback_used: false,
            model: self.provider.model().to_string(),
            generated_at: chrono::Utc::now(),
        })
    }

    async fn generate_with_retry(&self, prompt: &str) -> Result<GenerationReply> {
        let budget = if self.config.retry_on_error {
            self.config.max_retries
        } else {
            0
        };

        let mut attempt = 0u32;
        loop {
            match self.provider.generate(prompt).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    if attempt >= budget {
                        return Err(e);
                    }
                    attempt += 1;
                    let delay = jittered_backoff(attempt);
                    tracing::warn!(error = %e, attempt, ?delay, "generation failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// The fixed fallback keeps the citations and the computed confidence so
    /// callers can still see what the answer would have been grounded on.
    fn fallback_answer(&self, context: &AnswerContext, confidence: f32) -> Answer {
        Answer {
            text: INSUFFICIENT_INFO_ANSWER.to_string(),
            citations: context.citations.clone(),
            confidence,
            fallback_used: true,
            model: self.provider.model().to_string(),
            generated_at: chrono::Utc::now(),
        }
    }
}

// ============================================================================
// Confidence
// ============================================================================

/// Score answer confidence in [0, 1].
///
/// When the provider exposes average log-probabilities, confidence is
/// `exp(avg_logprobs)`. Otherwise it falls back to source coverage: the
/// fraction of context citation markers the answer actually references,
/// floored at 0.2 when sources were supplied (the model saw evidence even if
/// it cited none of it) and 0.0 when none were.
pub fn score_confidence(text: &str, context: &AnswerContext, avg_logprobs: Option<f64>) -> f32 {
    if let Some(avg) = avg_logprobs {
        return (avg.exp() as f32).clamp(0.0, 1.0);
    }

    if context.sources.is_empty() {
        return 0.0;
    }
    let cited = context
        .sources
        .iter()
        .filter(|s| text.contains(&format!("[{}]", s.index)))
        .count();
    let coverage = cited as f32 / context.sources.len() as f32;
    coverage.max(0.2)
}

/// Exponential backoff with about ±25% jitter. The jitter is derived from
/// the clock's subsecond nanos rather than a PRNG.
fn jittered_backoff(attempt: u32) -> Duration {
    let base = INITIAL_BACKOFF_MS * 2u64.pow(attempt.saturating_sub(1).min(5));
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    // Spread factor in [0.75, 1.25].
    let factor_millis = 750 + (nanos % 500);
    Duration::from_millis(base * factor_millis / 1000)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextSource;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted provider: pops one result per call, counts calls.
    struct ScriptedProvider {
        script: Mutex<Vec<Result<GenerationReply>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(mut script: Vec<Result<GenerationReply>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl GenerationProvider for ScriptedProvider {
        async fn generate(&self, _prompt: &str) -> Result<GenerationReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(PipelineError::GenerationFailed("script empty".into())))
        }

        fn model(&self) -> &str {
            "scripted"
        }
    }

    fn context_with_sources(n: usize) -> AnswerContext {
        let sources: Vec<ContextSource> = (1..=n)
            .map(|index| ContextSource {
                index,
                chunk_id: format!("chunk-{index}"),
                source_uri: format!("https://docs.example.dev/{index}"),
                content: format!("content {index}"),
                score: 0.9,
            })
            .collect();
        AnswerContext {
            question: "how does it work?".into(),
            citations: sources
                .iter()
                .map(|s| format!("[{}] {}", s.index, s.source_uri))
                .collect(),
            sources_block: "rendered".into(),
            token_estimate: 10,
            sources,
        }
    }

    fn answer_reply(text: &str, avg_logprobs: Option<f64>) -> Result<GenerationReply> {
        Ok(GenerationReply::Answer {
            text: text.into(),
            avg_logprobs,
        })
    }

    fn fast_config() -> AnswererConfig {
        AnswererConfig {
            max_retries: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_successful_answer_keeps_generated_text() {
        let provider = Arc::new(ScriptedProvider::new(vec![answer_reply(
            "Tokens expire hourly [1].",
            Some(-0.05),
        )]));
        let answerer = Answerer::new(provider, fast_config());
        let context = context_with_sources(1);

        let answer = answerer.answer(&context, "prompt").await.unwrap();
        assert_eq!(answer.text, "Tokens expire hourly [1].");
        assert!(!answer.fallback_used);
        assert!(answer.confidence > 0.9);
        assert_eq!(answer.citations.len(), 1);
    }

    // Low confidence replaces the text but keeps sources and the
    // computed confidence.
    #[tokio::test]
    async fn test_low_confidence_substitutes_fallback() {
        let provider = Arc::new(ScriptedProvider::new(vec![answer_reply(
            "A vague unsupported claim.",
            Some(-3.0), // exp(-3) ~ 0.05, far below the 0.4 threshold
        )]));
        let answerer = Answerer::new(provider, fast_config());
        let context = context_with_sources(2);

        let answer = answerer.answer(&context, "prompt").await.unwrap();
        assert_eq!(answer.text, INSUFFICIENT_INFO_ANSWER);
        assert!(answer.fallback_used);
        assert!(answer.confidence < 0.4 && answer.confidence > 0.0);
        assert_eq!(answer.citations.len(), 2);
    }

    #[tokio::test]
    async fn test_blocked_is_not_retried() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(GenerationReply::Blocked {
                category: "HARM_CATEGORY_DANGEROUS_CONTENT".into(),
            }),
            answer_reply("should never be reached", None),
        ]));
        let answerer = Answerer::new(provider.clone(), fast_config());
        let context = context_with_sources(1);

        let err = answerer.answer(&context, "prompt").await.unwrap_err();
        assert!(matches!(err, PipelineError::SafetyBlocked { .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_then_succeeds() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(PipelineError::GenerationFailed("HTTP 503".into())),
            answer_reply("Recovered answer [1].", Some(-0.1)),
        ]));
        let answerer = Answerer::new(provider.clone(), fast_config());
        let context = context_with_sources(1);

        let answer = answerer.answer(&context, "prompt").await.unwrap();
        assert_eq!(answer.text, "Recovered answer [1].");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(PipelineError::GenerationFailed("HTTP 503".into())),
            Err(PipelineError::GenerationFailed("HTTP 503".into())),
            Err(PipelineError::GenerationFailed("HTTP 503".into())),
        ]));
        let answerer = Answerer::new(provider.clone(), fast_config());
        let context = context_with_sources(1);

        let err = answerer.answer(&context, "prompt").await.unwrap_err();
        assert!(matches!(err, PipelineError::GenerationFailed(_)));
        // Initial attempt + 2 retries.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_disabled_fails_fast() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(PipelineError::GenerationFailed("HTTP 503".into())),
            answer_reply("never reached", None),
        ]));
        let config = AnswererConfig {
            retry_on_error: false,
            ..Default::default()
        };
        let answerer = Answerer::new(provider.clone(), config);
        let context = context_with_sources(1);

        assert!(answerer.answer(&context, "prompt").await.is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(PipelineError::Auth("bad key".into())),
            answer_reply("never reached", None),
        ]));
        let answerer = Answerer::new(provider.clone(), fast_config());
        let context = context_with_sources(1);

        let err = answerer.answer(&context, "prompt").await.unwrap_err();
        assert!(matches!(err, PipelineError::Auth(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_context_skips_provider() {
        let provider = Arc::new(ScriptedProvider::new(vec![answer_reply(
            "never reached",
            None,
        )]));
        let answerer = Answerer::new(provider.clone(), fast_config());
        let context = context_with_sources(0);

        let answer = answerer.answer(&context, "prompt").await.unwrap();
        assert_eq!(answer.text, INSUFFICIENT_INFO_ANSWER);
        assert!(answer.fallback_used);
        assert_eq!(answer.confidence, 0.0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_confidence_from_logprobs() {
        let context = context_with_sources(1);
        assert!(score_confidence("x", &context, Some(0.0)) >= 0.99);
        assert!(score_confidence("x", &context, Some(-3.0)) < 0.1);
    }

    #[test]
    fn test_confidence_coverage_heuristic() {
        let context = context_with_sources(2);
        // Both markers cited.
        assert_eq!(score_confidence("see [1] and [2]", &context, None), 1.0);
        // One of two cited.
        assert_eq!(score_confidence("only [1] here", &context, None), 0.5);
        // None cited but sources existed: floor applies.
        assert_eq!(score_confidence("no markers", &context, None), 0.2);
        // No sources at all.
        let empty = context_with_sources(0);
        assert_eq!(score_confidence("anything", &empty, None), 0.0);
    }

    #[test]
    fn test_jittered_backoff_bounds() {
        for attempt in 1..=3u32 {
            let base = INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1);
            let delay = jittered_backoff(attempt).as_millis() as u64;
            assert!(delay >= base * 3 / 4);
            assert!(delay <= base * 5 / 4);
        }
    }
}
