//! Content acquisition - bounded web traversal into Documents.
//!
//! The acquirer fetches a seed URI and follows links breadth-first under
//! `max_pages`/`max_depth` bounds, reducing each page to the intersection of
//! `content_selectors` minus `exclude_selectors`. Per-page failures are
//! retried, then skipped and recorded; an unreachable seed is fatal for the
//! run.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ego_tree::NodeId;
use scraper::{ElementRef, Html, Selector};
use tokio::sync::Semaphore;
use url::Url;
use uuid::Uuid;

use crate::config::AcquirerConfig;
use crate::error::{PipelineError, Result};

// ============================================================================
// Types
// ============================================================================

/// Closed content-type variant; the single dispatch point for type-specific
/// handling downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Html,
    Markdown,
    Code,
    Plaintext,
}

impl ContentType {
    /// Classify by URI path extension; HTTP responses default to Html.
    pub fn from_uri(uri: &str) -> Self {
        let path = uri.split(['?', '#']).next().unwrap_or(uri);
        let ext = path.rsplit('.').next().unwrap_or("").to_lowercase();
        match ext.as_str() {
            "md" | "markdown" => Self::Markdown,
            "rs" | "py" | "js" | "ts" | "go" | "java" | "c" | "cpp" | "rb" | "sh" => Self::Code,
            "txt" => Self::Plaintext,
            "html" | "htm" => Self::Html,
            _ => Self::Html,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Markdown => "markdown",
            Self::Code => "code",
            Self::Plaintext => "plaintext",
        }
    }
}

/// A unit of acquired content. Immutable once created; re-acquisition of the
/// same URI produces a new Document that supersedes the old one.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: Uuid,
    pub source_uri: String,
    pub raw_content: String,
    pub acquired_at: DateTime<Utc>,
    pub content_type: ContentType,
}

impl Document {
    /// Wrap already-provided content as a Document, bypassing the fetch path.
    pub fn from_text(source_uri: &str, raw_content: String, content_type: ContentType) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_uri: source_uri.to_string(),
            raw_content,
            acquired_at: Utc::now(),
            content_type,
        }
    }
}

/// A page that failed after its retry budget and was skipped.
#[derive(Debug, Clone)]
pub struct SkippedPage {
    pub uri: String,
    pub reason: String,
}

/// Outcome of one acquisition run.
#[derive(Debug)]
pub struct Acquisition {
    pub documents: Vec<Document>,
    pub skipped: Vec<SkippedPage>,
}

// ============================================================================
// WebAcquirer
// ============================================================================

/// Bounded breadth-first web acquirer.
pub struct WebAcquirer {
    client: reqwest::Client,
    config: AcquirerConfig,
}

impl WebAcquirer {
    pub fn new(config: AcquirerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| PipelineError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Acquire Documents starting from `seed_uri`.
    ///
    /// The seed is fetched first; if it fails after retries the whole run
    /// fails with [`PipelineError::SeedUnreachable`]. Every other page
    /// failure is recorded and skipped.
    pub async fn acquire(&self, seed_uri: &str) -> Result<Acquisition> {
        let seed = Url::parse(seed_uri).map_err(|e| PipelineError::SeedUnreachable {
            uri: seed_uri.to_string(),
            message: format!("invalid URI: {e}"),
        })?;

        tracing::info!(
            seed = %seed,
            max_pages = self.config.max_pages,
            max_depth = self.config.max_depth,
            "starting acquisition"
        );

        let seed_body = match self.fetch_with_retry(&seed).await {
            Ok(body) => body,
            Err(e) => {
                return Err(PipelineError::SeedUnreachable {
                    uri: seed_uri.to_string(),
                    message: e.to_string(),
                })
            }
        };

        let mut documents = Vec::new();
        let mut skipped = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(normalize_url(&seed));

        let (seed_doc, seed_links) = self.page_to_document(&seed, &seed_body);
        documents.push(seed_doc);

        // BFS level by level; each level's fetches run under a bounded
        // worker count, results aggregated after every worker finishes.
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut frontier: Vec<Url> = self.admit_links(&seed, seed_links, &mut visited);

        for depth in 1..=self.config.max_depth {
            if frontier.is_empty() || documents.len() >= self.config.max_pages {
                break;
            }

            let remaining = self.config.max_pages - documents.len();
            frontier.truncate(remaining);

            let mut handles = Vec::with_capacity(frontier.len());
            for url in frontier.drain(..) {
                let client = self.client.clone();
                let sem = Arc::clone(&semaphore);
                let retries = self.config.max_retries;
                let delay = Duration::from_millis(self.config.retry_delay_ms);

                handles.push(tokio::spawn(async move {
                    let result = match sem.acquire().await {
                        Ok(_permit) => fetch_with_retry_inner(&client, &url, retries, delay).await,
                        Err(_) => Err(PipelineError::Network("acquisition semaphore closed".into())),
                    };
                    (url, result)
                }));
            }

            let mut next_frontier = Vec::new();
            for handle in handles {
                match handle.await {
                    Ok((url, Ok(body))) => {
                        let (doc, links) = self.page_to_document(&url, &body);
                        tracing::debug!(uri = %url, depth, "page acquired");
                        documents.push(doc);
                        if depth < self.config.max_depth {
                            next_frontier.extend(self.admit_links(&url, links, &mut visited));
                        }
                    }
                    Ok((url, Err(e))) => {
                        tracing::warn!(uri = %url, error = %e, "page skipped after retries");
                        skipped.push(SkippedPage {
                            uri: url.to_string(),
                            reason: e.to_string(),
                        });
                    }
                    Err(e) => {
                        skipped.push(SkippedPage {
                            uri: String::new(),
                            reason: format!("worker task failed: {e}"),
                        });
                    }
                }
            }
            frontier = next_frontier;
        }

        tracing::info!(
            documents = documents.len(),
            skipped = skipped.len(),
            "acquisition complete"
        );
        Ok(Acquisition { documents, skipped })
    }

    /// Fetch one URL with the per-page retry policy.
    async fn fetch_with_retry(&self, url: &Url) -> Result<String> {
        fetch_with_retry_inner(
            &self.client,
            url,
            self.config.max_retries,
            Duration::from_millis(self.config.retry_delay_ms),
        )
        .await
    }

    /// Reduce a fetched page to a Document plus its outbound links.
    fn page_to_document(&self, url: &Url, body: &str) -> (Document, Vec<String>) {
        let html = Html::parse_document(body);
        let content = self.extract_content(&html);
        let links = extract_links(&html, url);

        let doc = Document {
            id: Uuid::new_v4(),
            source_uri: url.to_string(),
            raw_content: content,
            acquired_at: Utc::now(),
            content_type: ContentType::from_uri(url.as_str()),
        };
        (doc, links)
    }

    /// Intersect `content_selectors`, then subtract `exclude_selectors`.
    /// Exclusion runs after inclusion: an excluded node nested inside an
    /// included one is still removed.
    fn extract_content(&self, html: &Html) -> String {
        let excluded = self.excluded_node_ids(html);

        for selector_str in &self.config.content_selectors {
            let Ok(selector) = Selector::parse(selector_str) else {
                tracing::warn!(selector = %selector_str, "invalid content selector, skipping");
                continue;
            };
            let mut text = String::new();
            for element in html.select(&selector) {
                push_text_excluding(element, &excluded, &mut text);
            }
            let text = collapse_whitespace(&text);
            if !text.is_empty() {
                return text;
            }
        }

        // Fallback: whole body with exclusions still applied.
        if let Ok(selector) = Selector::parse("body") {
            if let Some(element) = html.select(&selector).next() {
                let mut text = String::new();
                push_text_excluding(element, &excluded, &mut text);
                return collapse_whitespace(&text);
            }
        }
        String::new()
    }

    fn excluded_node_ids(&self, html: &Html) -> HashSet<NodeId> {
        let mut excluded = HashSet::new();
        for selector_str in &self.config.exclude_selectors {
            let Ok(selector) = Selector::parse(selector_str) else {
                tracing::warn!(selector = %selector_str, "invalid exclude selector, skipping");
                continue;
            };
            for element in html.select(&selector) {
                excluded.insert(element.id());
            }
        }
        excluded
    }

    /// Filter candidate links by scheme, domain policy, and dedup.
    fn admit_links(
        &self,
        base: &Url,
        links: Vec<String>,
        visited: &mut HashSet<String>,
    ) -> Vec<Url> {
        let mut admitted = Vec::new();
        for link in links {
            let Ok(url) = Url::parse(&link) else {
                continue;
            };
            if url.scheme() != "http" && url.scheme() != "https" {
                continue;
            }
            // Cross-domain links are followed only when the same-domain
            // restriction is off.
            if self.config.follow_same_domain && url.host_str() != base.host_str() {
                continue;
            }
            if visited.insert(normalize_url(&url)) {
                admitted.push(url);
            }
        }
        admitted
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

async fn fetch_with_retry_inner(
    client: &reqwest::Client,
    url: &Url,
    max_retries: u32,
    retry_delay: Duration,
) -> Result<String> {
    let mut last_error = String::new();

    for attempt in 0..=max_retries {
        if attempt > 0 {
            // Linear backoff between page retries.
            tokio::time::sleep(retry_delay * attempt).await;
        }

        match client.get(url.as_str()).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response.text().await.map_err(|e| {
                        PipelineError::Network(format!("{url}: body read failed: {e}"))
                    });
                }
                last_error = format!("{url}: HTTP {status}");
                tracing::debug!(
                    uri = %url,
                    status = %status,
                    attempt = attempt + 1,
                    "fetch failed"
                );
            }
            Err(e) => {
                last_error = format!("{url}: {e}");
                tracing::debug!(uri = %url, error = %e, attempt = attempt + 1, "fetch failed");
            }
        }
    }

    Err(PipelineError::Network(last_error))
}

/// Collect text under `element`, skipping anything beneath an excluded node.
fn push_text_excluding(
    element: ElementRef,
    excluded: &HashSet<NodeId>,
    out: &mut String,
) {
    if excluded.contains(&element.id()) {
        return;
    }
    for node in element.descendants() {
        if let Some(text) = node.value().as_text() {
            let under_excluded = node.ancestors().any(|a| excluded.contains(&a.id()));
            if under_excluded {
                continue;
            }
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(trimmed);
            }
        }
    }
}

/// Extract all links, resolved against the base URL. Anchors, javascript:
/// and mailto: links are dropped.
fn extract_links(html: &Html, base: &Url) -> Vec<String> {
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut links = Vec::new();
    for element in html.select(&selector) {
        if let Some(href) = element.value().attr("href") {
            if href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:")
            {
                continue;
            }
            if let Ok(mut resolved) = base.join(href) {
                resolved.set_fragment(None);
                links.push(resolved.to_string());
            }
        }
    }
    links
}

/// Normalize a URL for dedup (strip fragment and trailing slash).
fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let mut s = normalized.to_string();
    if s.ends_with('/') && s.matches('/').count() > 3 {
        s.pop();
    }
    s
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> AcquirerConfig {
        AcquirerConfig {
            max_retries: 1,
            retry_delay_ms: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_content_type_from_uri() {
        assert_eq!(ContentType::from_uri("https://x.dev/a.md"), ContentType::Markdown);
        assert_eq!(ContentType::from_uri("https://x.dev/a.rs"), ContentType::Code);
        assert_eq!(ContentType::from_uri("https://x.dev/a.txt"), ContentType::Plaintext);
        assert_eq!(ContentType::from_uri("https://x.dev/guide"), ContentType::Html);
        assert_eq!(
            ContentType::from_uri("https://x.dev/a.md?ref=main"),
            ContentType::Markdown
        );
    }

    #[test]
    fn test_exclusion_applies_inside_included_node() {
        let acquirer = WebAcquirer::new(test_config()).unwrap();
        let html = Html::parse_document(
            r#"<html><body>
                <article>
                    Keep this text.
                    <nav>Navigation to drop</nav>
                    And keep this too.
                </article>
            </body></html>"#,
        );
        let content = acquirer.extract_content(&html);
        assert!(content.contains("Keep this text"));
        assert!(content.contains("keep this too"));
        assert!(!content.contains("Navigation"));
    }

    #[test]
    fn test_body_fallback_when_no_selector_matches() {
        let acquirer = WebAcquirer::new(test_config()).unwrap();
        let html = Html::parse_document("<html><body><p>plain body text</p></body></html>");
        let content = acquirer.extract_content(&html);
        assert_eq!(content, "plain body text");
    }

    #[test]
    fn test_extract_links_resolves_and_filters() {
        let html = Html::parse_document(
            r##"<html><body>
                <a href="/page2">rel</a>
                <a href="#frag">anchor</a>
                <a href="mailto:x@y.z">mail</a>
                <a href="https://other.dev/p">abs</a>
            </body></html>"##,
        );
        let base = Url::parse("https://docs.example.dev/page1").unwrap();
        let links = extract_links(&html, &base);
        assert!(links.contains(&"https://docs.example.dev/page2".to_string()));
        assert!(links.contains(&"https://other.dev/p".to_string()));
        assert!(!links.iter().any(|l| l.contains('#') || l.starts_with("mailto")));
    }

    #[test]
    fn test_same_domain_policy() {
        let acquirer = WebAcquirer::new(test_config()).unwrap();
        let base = Url::parse("https://docs.example.dev/").unwrap();
        let mut visited = HashSet::new();
        let admitted = acquirer.admit_links(
            &base,
            vec![
                "https://docs.example.dev/a".into(),
                "https://elsewhere.dev/b".into(),
            ],
            &mut visited,
        );
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].host_str(), Some("docs.example.dev"));
    }

    // A depth-0 crawl with max_pages=1 returns exactly the seed document.
    #[tokio::test]
    async fn test_single_page_no_link_following() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body><article>Root page. <a href="/next">next</a></article></body></html>"#,
            ))
            .mount(&server)
            .await;

        let config = AcquirerConfig {
            max_pages: 1,
            max_depth: 0,
            ..test_config()
        };
        let acquirer = WebAcquirer::new(config).unwrap();
        let result = acquirer.acquire(&server.uri()).await.unwrap();

        assert_eq!(result.documents.len(), 1);
        assert!(result.documents[0].raw_content.contains("Root page"));
        assert!(result.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_depth_bound_respected() {
        let server = MockServer::start().await;
        let page = |body: &str| ResponseTemplate::new(200).set_body_string(body.to_string());

        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(page(
                r#"<html><body><article>Root <a href="/l1">l1</a></article></body></html>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/l1"))
            .respond_with(page(
                r#"<html><body><article>Level one <a href="/l2">l2</a></article></body></html>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/l2"))
            .respond_with(page(
                r#"<html><body><article>Level two</article></body></html>"#,
            ))
            .mount(&server)
            .await;

        let config = AcquirerConfig {
            max_pages: 10,
            max_depth: 1,
            ..test_config()
        };
        let acquirer = WebAcquirer::new(config).unwrap();
        let result = acquirer.acquire(&server.uri()).await.unwrap();

        // Root (depth 0) + l1 (depth 1); l2 (depth 2) stays out.
        assert_eq!(result.documents.len(), 2);
        assert!(!result
            .documents
            .iter()
            .any(|d| d.raw_content.contains("Level two")));
    }

    #[tokio::test]
    async fn test_failed_page_is_skipped_not_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body><article>Root <a href="/broken">broken</a></article></body></html>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let config = AcquirerConfig {
            max_pages: 10,
            max_depth: 1,
            ..test_config()
        };
        let acquirer = WebAcquirer::new(config).unwrap();
        let result = acquirer.acquire(&server.uri()).await.unwrap();

        assert_eq!(result.documents.len(), 1);
        assert_eq!(result.skipped.len(), 1);
        assert!(result.skipped[0].reason.contains("500"));
    }

    #[tokio::test]
    async fn test_unreachable_seed_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let acquirer = WebAcquirer::new(test_config()).unwrap();
        let err = acquirer.acquire(&server.uri()).await.unwrap_err();
        assert!(matches!(err, PipelineError::SeedUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_max_pages_caps_total() {
        let server = MockServer::start().await;
        let links: String = (0..20).map(|i| format!(r#"<a href="/p{i}">p{i}</a> "#)).collect();
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                r#"<html><body><article>Root {links}</article></body></html>"#
            )))
            .mount(&server)
            .await;
        for i in 0..20 {
            Mock::given(method("GET"))
                .and(path(format!("/p{i}")))
                .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                    r#"<html><body><article>Page {i} content</article></body></html>"#
                )))
                .mount(&server)
                .await;
        }

        let config = AcquirerConfig {
            max_pages: 5,
            max_depth: 2,
            ..test_config()
        };
        let acquirer = WebAcquirer::new(config).unwrap();
        let result = acquirer.acquire(&server.uri()).await.unwrap();
        assert_eq!(result.documents.len(), 5);
    }
}
