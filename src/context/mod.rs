//! Context composition - ranked passages become a prompt-ready context.
//!
//! Sources are packed greedily in rank order under a token-estimated budget,
//! each rendered through the configured per-source template and paired with a
//! citation label. Prompt rendering is pure string substitution.

use crate::config::ComposerConfig;
use crate::retrieve::RetrievedPassage;

// ============================================================================
// Types
// ============================================================================

/// One source admitted into the context. `index` is the 1-based citation
/// marker used in the rendered block and the citation list.
#[derive(Debug, Clone)]
pub struct ContextSource {
    pub index: usize,
    pub chunk_id: String,
    pub source_uri: String,
    pub content: String,
    pub score: f32,
}

/// Everything the answerer needs for one question.
#[derive(Debug, Clone)]
pub struct AnswerContext {
    pub question: String,
    pub sources: Vec<ContextSource>,
    /// Rendered source block, ready for `{sources}` substitution.
    pub sources_block: String,
    pub citations: Vec<String>,
    /// Token estimate of the rendered source block.
    pub token_estimate: usize,
}

impl AnswerContext {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

// ============================================================================
// ContextComposer
// ============================================================================

/// Packs retrieved passages into an [`AnswerContext`].
pub struct ContextComposer {
    config: ComposerConfig,
}

impl ContextComposer {
    pub fn new(config: ComposerConfig) -> Self {
        Self { config }
    }

    /// Compose a context from passages already ranked best-first.
    ///
    /// Packing is greedy: passages are admitted in rank order until one would
    /// push the token estimate past `max_context_length` or `max_sources` is
    /// reached. A passage that does not fit ends the packing; weaker
    /// passages are never promoted over a stronger one that was cut.
    pub fn compose(&self, question: &str, passages: &[RetrievedPassage]) -> AnswerContext {
        let mut sources = Vec::new();
        let mut rendered_entries = Vec::new();
        let mut citations = Vec::new();
        let mut token_total = 0usize;

        for passage in passages.iter().take(self.config.max_sources) {
            let index = sources.len() + 1;
            let entry = render_source_entry(&self.config.context_format, index, passage);
            let entry_tokens = estimate_tokens(&entry);

            if token_total + entry_tokens > self.config.max_context_length {
                tracing::debug!(
                    index,
                    entry_tokens,
                    token_total,
                    "context budget reached, stopping packing"
                );
                break;
            }

            token_total += entry_tokens;
            if self.config.include_citations {
                citations.push(render_citation(&self.config.citation_format, index, passage));
            }
            sources.push(ContextSource {
                index,
                chunk_id: passage.chunk_id.clone(),
                source_uri: passage.source_uri.clone(),
                content: passage.content.clone(),
                score: passage.combined_score,
            });
            rendered_entries.push(entry);
        }

        AnswerContext {
            question: question.to_string(),
            sources,
            sources_block: rendered_entries.join("\n\n"),
            citations,
            token_estimate: token_total,
        }
    }

    /// Render the final prompt for a composed context.
    pub fn render(&self, context: &AnswerContext) -> String {
        render_prompt(
            &self.config.system_prompt_template,
            &context.sources_block,
            &context.question,
        )
    }
}

// ============================================================================
// Pure Rendering
// ============================================================================

/// Substitute `{sources}` and `{question}` into the prompt template.
/// Pure string work, no I/O and no hidden state.
pub fn render_prompt(template: &str, sources: &str, question: &str) -> String {
    template
        .replace("{sources}", sources)
        .replace("{question}", question)
}

fn render_source_entry(template: &str, index: usize, passage: &RetrievedPassage) -> String {
    template
        .replace("{index}", &index.to_string())
        .replace("{source_type}", passage.content_type.as_str())
        .replace("{content}", &passage.content)
}

fn render_citation(template: &str, index: usize, passage: &RetrievedPassage) -> String {
    template
        .replace("{index}", &index.to_string())
        .replace("{uri}", &passage.source_uri)
}

/// Rough token count: one token per 4 characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

// ============================================================================
// Tests
// ============================================================================
