use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP 429 from the provider. The caller owns backoff.
    #[error("rate limited by provider")]
    RateLimited,

    /// Structured error body from the provider.
    #[error("provider error {code}: {message}")]
    Provider { code: i32, message: String },

    /// The provider has no answer for the queried identifier.
    #[error("no data for the queried identifier")]
    NotFound,

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed response body: {0}")]
    Body(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
    /// True when retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::RateLimited | ApiError::Transport(_) => true,
            ApiError::Status(code) => *code >= 500,
            _ => false,
        }
    }
}
