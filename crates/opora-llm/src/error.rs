use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Schema parse failed after retry: {0}")]
    Parse(String),

    #[error("Span validation failed: {0}")]
    InvalidSpans(String),

    #[error("Empty completion")]
    EmptyCompletion,
}

impl LlmError {
    /// Transient failures are retried by the job layer; validation failures
    /// are handled locally (skip the step) and never bubble to the user.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Http(_) | LlmError::RateLimited { .. } | LlmError::Api { status: 500..=599, .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;
