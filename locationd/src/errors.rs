use thiserror::Error;

#[derive(Error, Debug)]
pub enum LocationError {
    #[error("configuration error: {0}")]
    Config(String),

    /// No source passed its availability probe at startup.
    #[error("no location sources available")]
    NoSourcesAvailable,

    /// At least one source was available but every attempt failed.
    #[error("all location sources failed: {0}")]
    AllSourcesFailed(String),

    #[error("invalid cell identifier: {0}")]
    InvalidCellIdentifier(String),

    /// The policy rate limiter refused a lookup token.
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Every remote attempt for a resolution failed.
    #[error("remote resolution unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("provider error {code}: {message}")]
    Api { code: i32, message: String },

    /// The embedded store could not be opened or created.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store write failed: {0}")]
    WriteFailed(String),

    #[error("cellular scan error: {0}")]
    CellScan(String),

    #[error("GNSS read error: {0}")]
    GnssRead(String),

    /// A collect did not finish within its per-source budget.
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// Out-of-range coordinates, stale timestamps, malformed fields. The
    /// offending item is skipped, never fatal.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A cycle completed but no fix cleared validation or the quality gate.
    #[error("no acceptable fix this cycle")]
    NoFix,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, LocationError>;

impl From<ridge_geolocation_api::ApiError> for LocationError {
    fn from(err: ridge_geolocation_api::ApiError) -> Self {
        use ridge_geolocation_api::ApiError;
        match err {
            ApiError::RateLimited => {
                LocationError::RateLimitExceeded("provider returned 429".into())
            }
            ApiError::Provider { code, message } => LocationError::Api { code, message },
            other => LocationError::RemoteUnavailable(other.to_string()),
        }
    }
}
