//! LLM error types and the transient/permanent split

use std::time::Duration;
use thiserror::Error;

/// HTTP statuses retried per the transport policy
const RETRYABLE_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// Errors that can occur during LLM operations
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cancelled")]
    Cancelled,
}

impl LlmError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. })
    }

    /// Check if this error is retryable
    ///
    /// Connection/socket errors, timeouts, and 408/429/5xx transient statuses
    /// retry; 4xx client errors and malformed responses never do. User
    /// cancellation is never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } => true,
            LlmError::ApiError { status, .. } => RETRYABLE_STATUSES.contains(status),
            LlmError::Network(e) => !e.is_builder() && !e.is_decode(),
            LlmError::Timeout(_) => true,
            LlmError::InvalidResponse(_) => false,
            LlmError::Json(_) => false,
            LlmError::Cancelled => false,
        }
    }

    /// Get the retry duration if this is a rate limit error
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_is_retryable() {
        let err = LlmError::RateLimited {
            retry_after: Duration::from_secs(60),
        };
        assert!(err.is_rate_limit());
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_retryable_statuses() {
        for status in [408u16, 429, 500, 502, 503, 504] {
            assert!(
                LlmError::ApiError {
                    status,
                    message: String::new()
                }
                .is_retryable(),
                "{status} should retry"
            );
        }
        for status in [400u16, 401, 403, 404, 405, 422] {
            assert!(
                !LlmError::ApiError {
                    status,
                    message: String::new()
                }
                .is_retryable(),
                "{status} should not retry"
            );
        }
    }

    #[test]
    fn test_timeout_retryable_cancel_not() {
        assert!(LlmError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(!LlmError::Cancelled.is_retryable());
        assert!(!LlmError::InvalidResponse("bad".to_string()).is_retryable());
    }
}
