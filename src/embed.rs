use anyhow::{anyhow, bail, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::ProviderConfig;
use crate::db;

/// Sentence-transformer output dimension the store expects.
pub const EMBEDDING_DIM: usize = 384;

/// Enrichment input cap, applied before submission.
const MAX_EMBED_CHARS: usize = 1_000;

/// Decoupled enrichment pass: fills the optional embedding vector on stored
/// insights via a Hugging Face-style inference endpoint. Never invoked by
/// the pipeline itself.
pub struct EmbedStage {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

pub struct EnrichStats {
    pub total: usize,
    pub ok: usize,
    pub errors: usize,
}

impl EmbedStage {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        }
    }

    /// Embed all insights still missing a vector, one request per row. A
    /// failed row is logged and skipped; siblings proceed.
    pub async fn enrich(&self, conn: &Connection, limit: Option<usize>) -> Result<EnrichStats> {
        let pending = db::unembedded_insights(conn, limit)?;
        let total = pending.len();

        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec})")?
                .progress_chars("=> "),
        );

        let mut ok = 0usize;
        let mut errors = 0usize;
        for (id, text) in pending {
            match self.embed_text(&text).await {
                Ok(vector) => {
                    db::set_embedding(conn, id, &serde_json::to_string(&vector)?)?;
                    ok += 1;
                }
                Err(e) => {
                    warn!("embedding failed for insight {}: {:#}", id, e);
                    errors += 1;
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        Ok(EnrichStats { total, ok, errors })
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let input = truncate_chars(text, MAX_EMBED_CHARS);
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({ "inputs": input }))
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("inference endpoint returned {}", response.status());
        }
        let body: Value = response.json().await?;
        parse_embedding(&body)
    }
}

/// Parse an inference reply into a fixed-length vector. Accepts both the
/// flat `[f, f, ...]` shape and the batched `[[f, f, ...]]` shape.
fn parse_embedding(body: &Value) -> Result<Vec<f32>> {
    let outer = body
        .as_array()
        .ok_or_else(|| anyhow!("embedding response is not an array"))?;
    let array = match outer.first().and_then(Value::as_array) {
        Some(inner) => inner,
        None => outer,
    };

    let mut vector = Vec::with_capacity(array.len());
    for element in array {
        let f = element
            .as_f64()
            .ok_or_else(|| anyhow!("non-numeric embedding element"))?;
        vector.push(f as f32);
    }
    if vector.len() != EMBEDDING_DIM {
        bail!(
            "unexpected embedding dimension {} (want {})",
            vector.len(),
            EMBEDDING_DIM
        );
    }
    Ok(vector)
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn floats(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64 / 1000.0).collect()
    }

    #[test]
    fn parses_flat_vector() {
        let body = serde_json::to_value(floats(EMBEDDING_DIM)).unwrap();
        let vector = parse_embedding(&body).unwrap();
        assert_eq!(vector.len(), EMBEDDING_DIM);
        assert_eq!(vector[1], 0.001);
    }

    #[test]
    fn parses_batched_vector() {
        let body = serde_json::to_value(vec![floats(EMBEDDING_DIM)]).unwrap();
        assert_eq!(parse_embedding(&body).unwrap().len(), EMBEDDING_DIM);
    }

    #[test]
    fn rejects_wrong_dimension() {
        let body = serde_json::to_value(floats(12)).unwrap();
        assert!(parse_embedding(&body).is_err());
    }

    #[test]
    fn rejects_non_numeric() {
        let body = serde_json::json!(["a", "b"]);
        assert!(parse_embedding(&body).is_err());
        assert!(parse_embedding(&serde_json::json!({"error": "loading"})).is_err());
    }

    #[test]
    fn input_truncated_to_cap() {
        let s = "y".repeat(MAX_EMBED_CHARS + 100);
        assert_eq!(truncate_chars(&s, MAX_EMBED_CHARS).len(), MAX_EMBED_CHARS);
    }
}
