use thiserror::Error;

/// Failure classification for ClickUp API calls.
///
/// `RateLimited`, `Server` and `Network` are retryable; everything else is
/// returned to the caller immediately. `NotFound` is fatal to the call but
/// recovered by the syncer (unlink and recreate).
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request failed ({status}): {message}")]
    Request { status: u16, message: String },

    #[error("run deadline exceeded")]
    DeadlineExceeded,
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimited(_) | ApiError::Server { .. } | ApiError::Network(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }
}
