use thiserror::Error;

/// Result type alias used across the scout crates.
pub type Result<T> = std::result::Result<T, ScoutError>;

#[derive(Error, Debug)]
pub enum ScoutError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition violated: {0}")]
    PreconditionViolated(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("source error: {0}")]
    Source(String),

    #[error("analyzer unavailable: {0}")]
    AnalyzerUnavailable(String),

    #[error("analyzer returned an empty response")]
    AnalyzerEmptyResponse,

    #[error("analyzer response shape: {0}")]
    AnalyzerBadShape(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
