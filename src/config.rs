use std::path::PathBuf;

use anyhow::{bail, Result};

const DEFAULT_DB_PATH: &str = "data/rivalwatch.sqlite";
const DEFAULT_FIRECRAWL_ENDPOINT: &str = "https://api.firecrawl.dev";
const DEFAULT_APIFY_ENDPOINT: &str =
    "https://api.apify.com/v2/acts/apify~web-scraper/run-sync-get-dataset-items";
const DEFAULT_GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";
const DEFAULT_HUGGINGFACE_ENDPOINT: &str =
    "https://api-inference.huggingface.co/models/sentence-transformers/all-MiniLM-L6-v2";

/// Credentials for one HTTP content or inference provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub endpoint: String,
    pub api_key: String,
}

/// Completion-model connection settings.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

/// Everything the pipeline reads from the environment, resolved once at
/// startup and injected into each stage at construction. Stages never look
/// at the environment themselves.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub primary: ProviderConfig,
    pub fallback: ProviderConfig,
    pub completion: CompletionConfig,
    /// Embedding enrichment is decoupled from the pipeline, so its
    /// credential is optional here; the `embed` command requires it.
    pub embedding: Option<ProviderConfig>,
}

impl Config {
    /// Read configuration from the process environment, failing fast if any
    /// required credential is missing.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing: Vec<&str> = Vec::new();
        let mut require = |key: &'static str| -> String {
            match get(key) {
                Some(value) if !value.trim().is_empty() => value,
                _ => {
                    missing.push(key);
                    String::new()
                }
            }
        };

        let firecrawl_key = require("FIRECRAWL_API_KEY");
        let apify_key = require("APIFY_API_KEY");
        let gemini_key = require("GEMINI_API_KEY");

        let config = Config {
            db_path: get("RIVALWATCH_DB")
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string())
                .into(),
            primary: ProviderConfig {
                endpoint: get("FIRECRAWL_ENDPOINT")
                    .unwrap_or_else(|| DEFAULT_FIRECRAWL_ENDPOINT.to_string()),
                api_key: firecrawl_key,
            },
            fallback: ProviderConfig {
                endpoint: get("APIFY_ENDPOINT")
                    .unwrap_or_else(|| DEFAULT_APIFY_ENDPOINT.to_string()),
                api_key: apify_key,
            },
            completion: CompletionConfig {
                endpoint: get("GEMINI_ENDPOINT")
                    .unwrap_or_else(|| DEFAULT_GEMINI_ENDPOINT.to_string()),
                api_key: gemini_key,
                model: get("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            },
            embedding: get("HUGGINGFACE_API_KEY")
                .filter(|key| !key.trim().is_empty())
                .map(|api_key| ProviderConfig {
                    endpoint: get("HUGGINGFACE_ENDPOINT")
                        .unwrap_or_else(|| DEFAULT_HUGGINGFACE_ENDPOINT.to_string()),
                    api_key,
                }),
        };

        if !missing.is_empty() {
            bail!(
                "missing required environment variables: {}",
                missing.join(", ")
            );
        }
        Ok(config)
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn load(vars: &HashMap<String, String>) -> Result<Config> {
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn all_required_present() {
        let vars = env(&[
            ("FIRECRAWL_API_KEY", "fc-key"),
            ("APIFY_API_KEY", "ap-key"),
            ("GEMINI_API_KEY", "gm-key"),
        ]);
        let config = load(&vars).unwrap();
        assert_eq!(config.primary.api_key, "fc-key");
        assert_eq!(config.fallback.api_key, "ap-key");
        assert_eq!(config.completion.api_key, "gm-key");
        assert_eq!(config.completion.model, DEFAULT_GEMINI_MODEL);
        assert!(config.embedding.is_none());
        assert_eq!(config.db_path, PathBuf::from(DEFAULT_DB_PATH));
    }

    #[test]
    fn all_missing_reported_together() {
        let err = load(&env(&[])).unwrap_err().to_string();
        assert!(err.contains("FIRECRAWL_API_KEY"));
        assert!(err.contains("APIFY_API_KEY"));
        assert!(err.contains("GEMINI_API_KEY"));
    }

    #[test]
    fn blank_value_counts_as_missing() {
        let vars = env(&[
            ("FIRECRAWL_API_KEY", "  "),
            ("APIFY_API_KEY", "ap-key"),
            ("GEMINI_API_KEY", "gm-key"),
        ]);
        let err = load(&vars).unwrap_err().to_string();
        assert!(err.contains("FIRECRAWL_API_KEY"));
        assert!(!err.contains("APIFY_API_KEY"));
    }

    #[test]
    fn overrides_respected() {
        let vars = env(&[
            ("FIRECRAWL_API_KEY", "fc"),
            ("APIFY_API_KEY", "ap"),
            ("GEMINI_API_KEY", "gm"),
            ("RIVALWATCH_DB", "/tmp/other.sqlite"),
            ("FIRECRAWL_ENDPOINT", "http://localhost:9001"),
            ("GEMINI_MODEL", "gemini-1.5-pro"),
            ("HUGGINGFACE_API_KEY", "hf"),
        ]);
        let config = load(&vars).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/other.sqlite"));
        assert_eq!(config.primary.endpoint, "http://localhost:9001");
        assert_eq!(config.completion.model, "gemini-1.5-pro");
        let embedding = config.embedding.unwrap();
        assert_eq!(embedding.api_key, "hf");
        assert_eq!(embedding.endpoint, DEFAULT_HUGGINGFACE_ENDPOINT);
    }
}
