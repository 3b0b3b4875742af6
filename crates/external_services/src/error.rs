//! Error types for external services.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("upstream returned status {0}")]
    UpstreamStatus(u16),

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("request weight budget exhausted, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl Error {
    /// True when the upstream itself is unreachable or failing. These are the
    /// failures that feed the circuit breaker; client-side gating does not.
    pub fn is_upstream_failure(&self) -> bool {
        match self {
            Error::Http(_) | Error::InvalidResponse(_) => true,
            Error::UpstreamStatus(status) => *status != 429,
            _ => false,
        }
    }

    /// True when the call was refused for rate-budget reasons, either by the
    /// local limiter or by the upstream (HTTP 429).
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. } | Error::UpstreamStatus(429)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
