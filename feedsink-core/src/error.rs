use std::time::Duration;
use thiserror::Error;

/// Failure of a remote feed, classified by how the caller must react.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Credentials rejected. Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Server asked us to slow down, optionally telling for how long.
    #[error("rate limited, retry after: {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// Network drop, timeout, server error. Retried with backoff.
    #[error("transient feed error: {0}")]
    Transient(String),

    /// The response could not be understood.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl FeedError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, FeedError::Auth(_))
    }
}
