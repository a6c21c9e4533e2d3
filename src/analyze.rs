use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::CompletionConfig;
use crate::db::{self, Category, Insight, NewInsight};
use crate::error::PipelineError;

/// Hard cap on page content submitted to the model. This is the scrape
/// stage's documented contract with this consumer.
pub const MAX_CONTENT_CHARS: usize = 8_000;

/// A model-proposed insight before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct InsightDraft {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
}

/// Completion backend able to turn a prompt into free text.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

// ── Gemini client ──

pub struct GeminiClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GeminiClient {
    pub fn new(config: &CompletionConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        }
    }
}

#[async_trait]
impl CompletionClient for GeminiClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.endpoint, self.model, self.api_key
        );
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
        };
        let response = self.client.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            bail!("completion endpoint returned {}", response.status());
        }
        let body: GenerateResponse = response.json().await?;
        let text = body
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .and_then(|p| p.text)
            .unwrap_or_default();
        Ok(text)
    }
}

// ── Stage ──

pub struct AnalyzeStage {
    completion: Box<dyn CompletionClient>,
}

impl AnalyzeStage {
    pub fn new(config: &CompletionConfig) -> Self {
        Self {
            completion: Box::new(GeminiClient::new(config)),
        }
    }

    pub fn with_client(completion: Box<dyn CompletionClient>) -> Self {
        Self { completion }
    }

    /// Run one analysis pass over scraped content: prompt the model, parse
    /// and validate its reply, persist surviving drafts, stamp the
    /// competitor's `last_checked`. Returns the rows actually inserted;
    /// unparseable model output yields zero rows, not an error.
    pub async fn analyze(
        &self,
        conn: &Connection,
        competitor_id: i64,
        competitor_name: &str,
        content: &str,
    ) -> Result<Vec<Insight>, PipelineError> {
        let prompt = build_prompt(competitor_name, content);
        let reply = self
            .completion
            .complete(&prompt)
            .await
            .map_err(|e| PipelineError::AnalysisUnavailable(format!("{e:#}")))?;

        let drafts = parse_insights(&reply).unwrap_or_default();
        debug!(
            "model proposed {} draft(s) for {}",
            drafts.len(),
            competitor_name
        );

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut inserted = Vec::new();
        for draft in drafts {
            let Some(new) = validate_draft(competitor_id, &now, draft) else {
                continue;
            };
            match db::insert_insight(conn, &new) {
                Ok(row) => inserted.push(row),
                // A failed row does not abort its siblings.
                Err(e) => warn!("failed to insert insight '{}': {}", new.title, e),
            }
        }

        db::touch_last_checked(conn, competitor_id, &now)?;
        Ok(inserted)
    }
}

/// Deterministic extraction prompt: competitor name plus content capped at
/// MAX_CONTENT_CHARS.
fn build_prompt(competitor_name: &str, content: &str) -> String {
    let content = truncate_chars(content, MAX_CONTENT_CHARS);
    format!(
        "Analyze the following content from {competitor_name}'s website and extract key \
         competitive insights.\n\n\
         Content:\n{content}\n\n\
         Please identify and extract:\n\
         1. New product launches or features\n\
         2. Funding announcements\n\
         3. Strategic partnerships\n\
         4. Major company updates\n\n\
         For each insight found, provide:\n\
         - Title (brief, catchy headline)\n\
         - Description (2-3 sentences)\n\
         - Category (product, funding, partnership, or launch)\n\n\
         Format your response as a JSON array of insights. If no significant insights are \
         found, return an empty array.\n\n\
         Example format:\n\
         [\n  {{\n    \"title\": \"New AI Feature Launch\",\n    \"description\": \"Company \
         announced revolutionary AI feature that transforms user experience.\",\n    \
         \"category\": \"launch\"\n  }}\n]"
    )
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Extract insight drafts from a free-text model reply. Strict parse of the
/// whole reply first, then the outermost bracketed span. The error variant
/// is deliberately swallowed by the caller: unparseable output means zero
/// insights, never a stage failure.
pub fn parse_insights(reply: &str) -> Result<Vec<InsightDraft>, serde_json::Error> {
    let trimmed = reply.trim();
    if let Ok(drafts) = serde_json::from_str::<Vec<InsightDraft>>(trimmed) {
        return Ok(drafts);
    }
    let span = bracketed_span(trimmed).unwrap_or(trimmed);
    serde_json::from_str(span)
}

fn bracketed_span(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}

/// Drop drafts with empty fields or a category outside the closed set.
/// Dropping is silent toward the caller.
fn validate_draft(competitor_id: i64, now: &str, draft: InsightDraft) -> Option<NewInsight> {
    let title = draft.title.trim();
    let description = draft.description.trim();
    if title.is_empty() || description.is_empty() {
        debug!("dropping draft with empty title or description");
        return None;
    }
    let Some(category) = Category::parse(&draft.category) else {
        debug!(
            "dropping draft '{}' with unknown category '{}'",
            title, draft.category
        );
        return None;
    };
    Some(NewInsight {
        competitor_id,
        title: title.to_string(),
        description: description.to_string(),
        category,
        source_url: None,
        timestamp: now.to_string(),
    })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    struct StubCompletion {
        reply: &'static str,
    }

    #[async_trait]
    impl CompletionClient for StubCompletion {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            Ok(self.reply.to_string())
        }
    }

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        db::init_schema(&conn).unwrap();
        conn
    }

    fn add_competitor(conn: &Connection) -> db::Competitor {
        db::insert_competitor(
            conn,
            &db::NewCompetitor {
                name: "Acme".to_string(),
                logo: "🏢".to_string(),
                website: "https://acme.test".to_string(),
                description: String::new(),
            },
        )
        .unwrap()
    }

    #[test]
    fn parses_bare_json_array() {
        let drafts = parse_insights(
            r#"[{"title":"T","description":"D","category":"launch"}]"#,
        )
        .unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].title, "T");
    }

    #[test]
    fn parses_array_wrapped_in_prose() {
        let reply = r#"Here you go: [{"title":"Acme launches Falcon 2.0","description":"New product line.","category":"launch"}] Hope that helps!"#;
        let drafts = parse_insights(reply).unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].title, "Acme launches Falcon 2.0");
    }

    #[test]
    fn parses_fenced_code_block() {
        let reply = "```json\n[{\"title\":\"T\",\"description\":\"D\",\"category\":\"funding\"}]\n```";
        let drafts = parse_insights(reply).unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].category, "funding");
    }

    #[test]
    fn no_bracketed_span_is_soft_error() {
        assert!(parse_insights("I found nothing notable.").is_err());
        assert!(parse_insights("").is_err());
    }

    #[test]
    fn malformed_span_is_soft_error() {
        assert!(parse_insights("Sure: [{\"title\": }]").is_err());
    }

    #[test]
    fn empty_array_is_zero_insights() {
        assert!(parse_insights("[]").unwrap().is_empty());
        assert!(parse_insights("No news today: []").unwrap().is_empty());
    }

    #[test]
    fn validation_drops_bad_drafts() {
        let draft = |title: &str, description: &str, category: &str| InsightDraft {
            title: title.to_string(),
            description: description.to_string(),
            category: category.to_string(),
        };
        let now = "2026-08-06T10:00:00Z";
        assert!(validate_draft(1, now, draft("T", "D", "launch")).is_some());
        assert!(validate_draft(1, now, draft("T", "D", "Launch")).is_some());
        assert!(validate_draft(1, now, draft("", "D", "launch")).is_none());
        assert!(validate_draft(1, now, draft("T", "  ", "launch")).is_none());
        assert!(validate_draft(1, now, draft("T", "D", "acquisition")).is_none());
    }

    #[test]
    fn prompt_embeds_name_and_truncates_content() {
        let long = "x".repeat(MAX_CONTENT_CHARS + 500);
        let prompt = build_prompt("Acme", &long);
        assert!(prompt.contains("Acme's website"));
        assert!(!prompt.contains(&"x".repeat(MAX_CONTENT_CHARS + 1)));
        assert!(prompt.contains(&"x".repeat(MAX_CONTENT_CHARS)));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "é".repeat(10);
        assert_eq!(truncate_chars(&s, 3), "ééé");
        assert_eq!(truncate_chars("ab", 5), "ab");
    }

    #[tokio::test]
    async fn invalid_category_dropped_siblings_persisted() {
        let conn = test_conn();
        let acme = add_competitor(&conn);
        let stage = AnalyzeStage::with_client(Box::new(StubCompletion {
            reply: r#"[
                {"title":"Good","description":"Kept.","category":"product"},
                {"title":"Bad","description":"Dropped.","category":"acquisition"},
                {"title":"Also good","description":"Kept too.","category":"FUNDING"}
            ]"#,
        }));

        let inserted = stage
            .analyze(&conn, acme.id, &acme.name, "some content")
            .await
            .unwrap();
        assert_eq!(inserted.len(), 2);
        assert_eq!(inserted[0].title, "Good");
        assert_eq!(inserted[0].category, Category::Product);
        assert!(!inserted[0].is_read);
        assert_eq!(inserted[1].category, Category::Funding);

        let stored = db::list_insights(&conn, false, None).unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn unparseable_reply_still_touches_last_checked() {
        let conn = test_conn();
        let acme = add_competitor(&conn);
        assert!(acme.last_checked.is_none());

        let stage = AnalyzeStage::with_client(Box::new(StubCompletion {
            reply: "I found nothing notable.",
        }));
        let inserted = stage
            .analyze(&conn, acme.id, &acme.name, "some content")
            .await
            .unwrap();
        assert!(inserted.is_empty());

        let refreshed = db::get_competitor(&conn, acme.id).unwrap();
        assert!(refreshed.last_checked.is_some());
    }
}
