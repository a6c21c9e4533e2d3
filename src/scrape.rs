use std::sync::LazyLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::error::PipelineError;

static IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap());
static BLANKS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Raw page content from one provider. Lives for a single pipeline run and
/// is never persisted.
#[derive(Debug, Clone)]
pub struct ScrapedContent {
    /// Markdown (primary) or plain-text (fallback) rendering of the page.
    pub markdown: String,
    pub html: Option<String>,
    pub metadata: Option<Value>,
    pub fetched_at: DateTime<Utc>,
}

/// Which provider supplied the content. Callers must branch on provenance
/// explicitly; total failure is a separate error value, not a variant here.
#[derive(Debug, Clone)]
pub enum ScrapeOutcome {
    Primary(ScrapedContent),
    Fallback(ScrapedContent),
}

impl ScrapeOutcome {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Primary(_) => "primary",
            Self::Fallback(_) => "fallback",
        }
    }

    pub fn content(&self) -> &ScrapedContent {
        match self {
            Self::Primary(content) | Self::Fallback(content) => content,
        }
    }
}

/// A single content-extraction backend.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch(&self, url: &str) -> Result<ScrapedContent>;
}

// ── Providers ──

/// Firecrawl-style extraction API: one POST per page, markdown + HTML back.
pub struct FirecrawlProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl FirecrawlProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        }
    }
}

#[async_trait]
impl ContentProvider for FirecrawlProvider {
    fn name(&self) -> &'static str {
        "firecrawl"
    }

    async fn fetch(&self, url: &str) -> Result<ScrapedContent> {
        let response = self
            .client
            .post(format!("{}/v1/scrape", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&json!({ "url": url, "formats": ["markdown", "html"] }))
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("firecrawl returned {}", response.status());
        }
        let body: Value = response.json().await?;
        Ok(parse_firecrawl(&body))
    }
}

/// Apify-style actor run: single page, zero crawl depth, synchronous dataset.
pub struct ApifyProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl ApifyProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        }
    }
}

#[async_trait]
impl ContentProvider for ApifyProvider {
    fn name(&self) -> &'static str {
        "apify"
    }

    async fn fetch(&self, url: &str) -> Result<ScrapedContent> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "startUrls": [{ "url": url }],
                "maxCrawlDepth": 0,
                "maxRequestsPerCrawl": 1,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("apify returned {}", response.status());
        }
        let body: Value = response.json().await?;
        Ok(parse_apify(&body))
    }
}

fn parse_firecrawl(body: &Value) -> ScrapedContent {
    let data = body.get("data").cloned().unwrap_or(Value::Null);
    let markdown = data
        .get("markdown")
        .and_then(Value::as_str)
        .unwrap_or_default();
    ScrapedContent {
        markdown: normalize_markdown(markdown),
        html: data
            .get("html")
            .and_then(Value::as_str)
            .map(str::to_string),
        metadata: data.get("metadata").filter(|m| !m.is_null()).cloned(),
        fetched_at: Utc::now(),
    }
}

fn parse_apify(body: &Value) -> ScrapedContent {
    let first = body
        .as_array()
        .and_then(|items| items.first())
        .cloned()
        .unwrap_or(Value::Null);
    let text = first.get("text").and_then(Value::as_str).unwrap_or_default();
    ScrapedContent {
        markdown: normalize_markdown(text),
        html: first
            .get("html")
            .and_then(Value::as_str)
            .map(str::to_string),
        metadata: None,
        fetched_at: Utc::now(),
    }
}

/// Remove markdown image syntax and collapse long blank runs.
fn normalize_markdown(md: &str) -> String {
    let cleaned = IMAGE_RE.replace_all(md, "");
    BLANKS_RE.replace_all(&cleaned, "\n\n").trim().to_string()
}

// ── Stage ──

pub struct ScrapeStage {
    primary: Box<dyn ContentProvider>,
    fallback: Box<dyn ContentProvider>,
}

impl ScrapeStage {
    pub fn new(primary: &ProviderConfig, fallback: &ProviderConfig) -> Self {
        Self {
            primary: Box::new(FirecrawlProvider::new(primary)),
            fallback: Box::new(ApifyProvider::new(fallback)),
        }
    }

    pub fn with_providers(
        primary: Box<dyn ContentProvider>,
        fallback: Box<dyn ContentProvider>,
    ) -> Self {
        Self { primary, fallback }
    }

    /// Fetch page content, trying the primary provider first. Both providers
    /// failing is the only error this stage produces; an empty page is a
    /// successful scrape and the caller's concern.
    pub async fn scrape(&self, url: &str) -> Result<ScrapeOutcome, PipelineError> {
        let primary_err = match self.primary.fetch(url).await {
            Ok(content) => {
                debug!("{} scraped {} ({} chars)", self.primary.name(), url, content.markdown.len());
                return Ok(ScrapeOutcome::Primary(content));
            }
            Err(e) => e,
        };
        warn!(
            "{} failed for {} ({:#}), trying {}",
            self.primary.name(),
            url,
            primary_err,
            self.fallback.name()
        );
        match self.fallback.fetch(url).await {
            Ok(content) => Ok(ScrapeOutcome::Fallback(content)),
            Err(fallback_err) => Err(PipelineError::ScrapeUnavailable {
                primary: format!("{primary_err:#}"),
                fallback: format!("{fallback_err:#}"),
            }),
        }
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    struct StubProvider {
        name: &'static str,
        content: Option<&'static str>,
    }

    #[async_trait]
    impl ContentProvider for StubProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch(&self, _url: &str) -> Result<ScrapedContent> {
            match self.content {
                Some(markdown) => Ok(ScrapedContent {
                    markdown: markdown.to_string(),
                    html: None,
                    metadata: None,
                    fetched_at: Utc::now(),
                }),
                None => bail!("{} is down", self.name),
            }
        }
    }

    fn stage(primary: Option<&'static str>, fallback: Option<&'static str>) -> ScrapeStage {
        ScrapeStage::with_providers(
            Box::new(StubProvider {
                name: "stub-primary",
                content: primary,
            }),
            Box::new(StubProvider {
                name: "stub-fallback",
                content: fallback,
            }),
        )
    }

    #[tokio::test]
    async fn primary_wins_when_healthy() {
        let outcome = stage(Some("primary page"), Some("fallback page"))
            .scrape("https://acme.test")
            .await
            .unwrap();
        assert_eq!(outcome.method(), "primary");
        assert_eq!(outcome.content().markdown, "primary page");
    }

    #[tokio::test]
    async fn falls_back_when_primary_fails() {
        let outcome = stage(None, Some("fallback page"))
            .scrape("https://acme.test")
            .await
            .unwrap();
        assert_eq!(outcome.method(), "fallback");
        assert_eq!(outcome.content().markdown, "fallback page");
    }

    #[tokio::test]
    async fn both_failing_is_unavailable() {
        let err = stage(None, None).scrape("https://acme.test").await.unwrap_err();
        match err {
            PipelineError::ScrapeUnavailable { primary, fallback } => {
                assert!(primary.contains("stub-primary"));
                assert!(fallback.contains("stub-fallback"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parse_firecrawl_payload() {
        let body = serde_json::json!({
            "success": true,
            "data": {
                "markdown": "# Acme\n\nAcme launches Falcon 2.0",
                "html": "<h1>Acme</h1>",
                "metadata": { "title": "Acme" },
            }
        });
        let content = parse_firecrawl(&body);
        assert!(content.markdown.contains("Falcon 2.0"));
        assert_eq!(content.html.as_deref(), Some("<h1>Acme</h1>"));
        assert!(content.metadata.is_some());
    }

    #[test]
    fn parse_firecrawl_empty_body() {
        let content = parse_firecrawl(&serde_json::json!({}));
        assert!(content.markdown.is_empty());
        assert!(content.html.is_none());
        assert!(content.metadata.is_none());
    }

    #[test]
    fn parse_apify_payload() {
        let body = serde_json::json!([
            { "text": "Acme launches Falcon 2.0", "html": "<p>Acme</p>" },
            { "text": "second item ignored" },
        ]);
        let content = parse_apify(&body);
        assert_eq!(content.markdown, "Acme launches Falcon 2.0");
        assert_eq!(content.html.as_deref(), Some("<p>Acme</p>"));
    }

    #[test]
    fn normalize_strips_images_and_blanks() {
        let md = "Intro\n\n\n\n![logo](https://acme.test/logo.png)\n\nOutro";
        assert_eq!(normalize_markdown(md), "Intro\n\nOutro");
    }
}
