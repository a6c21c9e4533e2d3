use thiserror::Error;

/// Failures that end a pipeline run. Stage-local recoverable conditions
/// (primary-provider fallback, malformed model JSON) are absorbed where they
/// happen and never reach this enum.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("both scrape providers failed (primary: {primary}; fallback: {fallback})")]
    ScrapeUnavailable { primary: String, fallback: String },

    #[error("scrape of {url} succeeded but yielded no usable content")]
    NoContent { url: String },

    #[error("completion endpoint unavailable: {0}")]
    AnalysisUnavailable(String),

    #[error("store error: {0}")]
    Persistence(#[from] rusqlite::Error),
}
