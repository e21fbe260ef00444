//! Content normalization - Documents become clean, enriched Chunks.
//!
//! Cleaning (HTML strip, pattern removal, whitespace), length filtering,
//! paragraph-boundary splitting and enrichment (language, summary, tags) are
//! all pure CPU transforms driven by [`NormalizerConfig`]; undersized content
//! is dropped, never padded, and oversized content is split at natural
//! boundaries. A piece that cannot be split under the maximum is dropped,
//! never truncated mid-text.

use std::collections::BTreeSet;

use regex::Regex;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::acquire::{ContentType, Document};
use crate::config::NormalizerConfig;

// ============================================================================
// Chunk
// ============================================================================

/// A normalized, self-contained unit of content ready for embedding.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Chunk {
    /// Deterministic id: SHA-256 of source URI and content, so re-ingesting
    /// the same page overwrites rather than duplicates.
    pub id: String,
    pub document_id: Uuid,
    pub source_uri: String,
    pub content_type: ContentType,
    /// Position of this chunk within its document, starting at 0.
    pub position: usize,
    pub content: String,
    pub language: Option<String>,
    pub summary: Option<String>,
    pub tags: BTreeSet<String>,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
}

/// Outcome of normalizing a batch of documents.
#[derive(Debug, Default)]
pub struct Normalization {
    pub chunks: Vec<Chunk>,
    /// Content units dropped for falling below `min_content_length`.
    pub dropped_undersized: usize,
    /// Pieces still above `max_content_length` after splitting, dropped so
    /// no chunk ever exceeds the bound.
    pub dropped_oversized: usize,
}

// ============================================================================
// Normalizer
// ============================================================================

/// Stateless document normalizer. All regexes are compiled once at
/// construction.
pub struct Normalizer {
    config: NormalizerConfig,
    html_tag_re: Regex,
    url_re: Regex,
    email_re: Regex,
    phone_re: Regex,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self {
            config,
            html_tag_re: Regex::new(r"<[^>]+>").unwrap(),
            url_re: Regex::new(r"https?://[^\s<>\u{201C}\u{201D}]+").unwrap(),
            email_re: Regex::new(r"[\w.+-]+@[\w-]+\.[\w.-]+").unwrap(),
            phone_re: Regex::new(r"\+?\d[\d\s().-]{7,}\d").unwrap(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(NormalizerConfig::default())
    }

    /// Normalize a batch of documents into chunks.
    pub fn normalize_all(&self, documents: &[Document]) -> Normalization {
        let mut result = Normalization::default();
        for doc in documents {
            let one = self.normalize(doc);
            result.chunks.extend(one.chunks);
            result.dropped_undersized += one.dropped_undersized;
            result.dropped_oversized += one.dropped_oversized;
        }
        tracing::info!(
            chunks = result.chunks.len(),
            dropped_undersized = result.dropped_undersized,
            dropped_oversized = result.dropped_oversized,
            "normalization complete"
        );
        result
    }

    /// Normalize a single document.
    pub fn normalize(&self, doc: &Document) -> Normalization {
        let cleaned = self.clean(&doc.raw_content, doc.content_type);

        let mut chunks = Vec::new();
        let mut dropped_undersized = 0usize;
        let mut dropped_oversized = 0usize;

        if cleaned.len() < self.config.min_content_length {
            if !cleaned.is_empty() {
                tracing::debug!(uri = %doc.source_uri, len = cleaned.len(), "content dropped, below minimum");
                dropped_undersized += 1;
            }
            return Normalization {
                chunks,
                dropped_undersized,
                dropped_oversized,
            };
        }

        for piece in self.split(&cleaned) {
            if piece.len() < self.config.min_content_length {
                dropped_undersized += 1;
                continue;
            }
            // An unbroken run with no usable boundary can survive splitting
            // still over the maximum; it is dropped, not truncated.
            if piece.len() > self.config.max_content_length {
                tracing::debug!(uri = %doc.source_uri, len = piece.len(), "piece dropped, above maximum");
                dropped_oversized += 1;
                continue;
            }
            let position = chunks.len();
            chunks.push(self.build_chunk(doc, position, piece));
        }

        Normalization {
            chunks,
            dropped_undersized,
            dropped_oversized,
        }
    }

    // ------------------------------------------------------------------
    // Cleaning
    // ------------------------------------------------------------------

    fn clean(&self, raw: &str, content_type: ContentType) -> String {
        let mut text = raw.to_string();

        // HTML arrives pre-extracted from the acquirer, but directly-provided
        // documents may still carry markup.
        if self.config.remove_html && content_type == ContentType::Html {
            text = self.html_tag_re.replace_all(&text, " ").into_owned();
        }
        if self.config.remove_urls {
            text = self.url_re.replace_all(&text, "").into_owned();
        }
        if self.config.remove_emails {
            text = self.email_re.replace_all(&text, "").into_owned();
        }
        if self.config.remove_phone_numbers {
            text = self.phone_re.replace_all(&text, "").into_owned();
        }
        if self.config.normalize_whitespace {
            text = normalize_whitespace(&text);
        }
        text.trim().to_string()
    }

    // ------------------------------------------------------------------
    // Splitting
    // ------------------------------------------------------------------

    /// Split text exceeding `max_content_length` at paragraph boundaries,
    /// falling back to line and then sentence boundaries for oversized
    /// paragraphs. No piece is ever truncated mid-word.
    fn split(&self, text: &str) -> Vec<String> {
        let max = self.config.max_content_length;
        if text.len() <= max {
            return vec![text.to_string()];
        }

        let mut pieces = Vec::new();
        let mut current = String::new();

        for para in text.split("\n\n") {
            let para = para.trim();
            if para.is_empty() {
                continue;
            }

            if !current.is_empty() && current.len() + para.len() + 2 > max {
                pieces.push(std::mem::take(&mut current));
            }

            if para.len() > max {
                if !current.is_empty() {
                    pieces.push(std::mem::take(&mut current));
                }
                // Oversized paragraph: split by sentences.
                for sentence in split_sentences(para) {
                    if !current.is_empty() && current.len() + sentence.len() + 1 > max {
                        pieces.push(std::mem::take(&mut current));
                    }
                    if !current.is_empty() {
                        current.push(' ');
                    }
                    current.push_str(sentence);
                }
            } else {
                if !current.is_empty() {
                    current.push_str("\n\n");
                }
                current.push_str(para);
            }
        }

        if !current.is_empty() {
            pieces.push(current);
        }

        self.merge_small_pieces(pieces)
    }

    /// Merge adjacent pieces that fell below the minimum, as long as the
    /// merge stays within the maximum.
    fn merge_small_pieces(&self, pieces: Vec<String>) -> Vec<String> {
        let mut result: Vec<String> = Vec::new();
        for piece in pieces {
            if let Some(last) = result.last_mut() {
                if last.len() < self.config.min_content_length
                    && last.len() + piece.len() + 2 <= self.config.max_content_length
                {
                    last.push_str("\n\n");
                    last.push_str(&piece);
                    continue;
                }
            }
            result.push(piece);
        }
        result
    }

    // ------------------------------------------------------------------
    // Enrichment
    // ------------------------------------------------------------------

    fn build_chunk(&self, doc: &Document, position: usize, content: String) -> Chunk {
        let language = if self.config.detect_language {
            detect_language(&content)
        } else {
            None
        };
        let summary = if self.config.generate_summary {
            Some(self.summarize(&content))
        } else {
            None
        };
        let tags = if self.config.extract_tags {
            self.extract_tags(&content)
        } else {
            BTreeSet::new()
        };

        Chunk {
            id: chunk_id(&doc.source_uri, &content),
            document_id: doc.id,
            source_uri: doc.source_uri.clone(),
            content_type: doc.content_type,
            position,
            content,
            language,
            summary,
            tags,
            acquired_at: doc.acquired_at,
        }
    }

    /// Leading sentences up to `summary_max_length`, truncated at a char
    /// boundary with an ellipsis if even the first sentence is too long.
    fn summarize(&self, content: &str) -> String {
        let max = self.config.summary_max_length;
        let mut summary = String::new();

        for sentence in split_sentences(content) {
            if summary.is_empty() && sentence.len() > max {
                let cut = floor_char_boundary(sentence, max.saturating_sub(3));
                return format!("{}...", sentence[..cut].trim_end());
            }
            if summary.len() + sentence.len() + 1 > max {
                break;
            }
            if !summary.is_empty() {
                summary.push(' ');
            }
            summary.push_str(sentence);
        }
        summary
    }

    /// Tags are matched from the configured vocabulary by case-insensitive
    /// word presence. The set form deduplicates a vocabulary that lists the
    /// same tag twice.
    fn extract_tags(&self, content: &str) -> BTreeSet<String> {
        let lower = content.to_lowercase();
        self.config
            .common_tags
            .iter()
            .filter(|tag| lower.contains(&tag.to_lowercase()))
            .cloned()
            .collect()
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Deterministic chunk id: hex SHA-256 over source URI and content.
pub fn chunk_id(source_uri: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_uri.as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Collapse runs of spaces/tabs and 3+ newlines, preserving paragraph breaks.
fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            blank_run += 1;
            if blank_run == 1 {
                out.push('\n');
            }
        } else {
            blank_run = 0;
            out.push_str(&collapsed);
            out.push('\n');
        }
    }
    out.trim().to_string()
}

/// Naive sentence splitter on `.`, `!`, `?` followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let bytes = text.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if matches!(bytes[i], b'.' | b'!' | b'?') {
            let next = i + 1;
            if next >= bytes.len() || bytes[next].is_ascii_whitespace() {
                let sentence = text[start..=i].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                start = next;
            }
        }
        i += 1;
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Stopword-ratio language guess over a small built-in vocabulary.
/// Returns None when no language clears the ratio threshold.
fn detect_language(content: &str) -> Option<String> {
    const STOPWORDS: &[(&str, &[&str])] = &[
        ("en", &["the", "and", "is", "of", "to", "in", "that", "for", "with", "are"]),
        ("es", &["el", "la", "de", "que", "y", "en", "los", "del", "las", "por"]),
        ("de", &["der", "die", "und", "das", "ist", "von", "den", "mit", "für", "ein"]),
        ("fr", &["le", "la", "les", "des", "est", "que", "dans", "pour", "une", "sur"]),
    ];

    let words: Vec<String> = content
        .split_whitespace()
        .take(200)
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect();
    if words.len() < 5 {
        return None;
    }

    let mut best: Option<(&str, f32)> = None;
    for (lang, stops) in STOPWORDS {
        let hits = words.iter().filter(|w| stops.contains(&w.as_str())).count();
        let ratio = hits as f32 / words.len() as f32;
        if best.map_or(true, |(_, b)| ratio > b) {
            best = Some((lang, ratio));
        }
    }

    match best {
        Some((lang, ratio)) if ratio >= 0.03 => Some(lang.to_string()),
        _ => None,
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
// Tests
// ============================================================================
