pub type Result<T> = std::result::Result<T, AiError>;

#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("model returned no content")]
    EmptyResponse,

    #[error("model returned no structured output")]
    NoStructuredOutput,
}
