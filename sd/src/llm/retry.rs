//! Retry with exponential backoff and jitter
//!
//! Every outbound LLM call goes through this policy: base 2 s doubling to a
//! 30 s cap, ±25% jitter, five attempts. Only transient transport errors
//! retry; cancellation aborts a pending backoff without the next attempt.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::cancel::CancelToken;

use super::LlmError;

/// Backoff policy for transient transport failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,

    /// Jitter fraction applied as ±(delay * jitter)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before the given retry (attempt starts at 1)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);

        let jitter_range = exp.as_millis() as f64 * self.jitter;
        let offset: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let with_jitter = (exp.as_millis() as f64 + offset).max(0.0);
        Duration::from_millis(with_jitter as u64)
    }

    /// Run an operation with retries
    ///
    /// `op` receives the attempt number. A rate-limit error waits the
    /// server-provided duration instead of the computed backoff.
    pub async fn run<T, F, Fut>(&self, cancel: &CancelToken, mut op: F) -> Result<T, LlmError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.max_attempts => {
                    warn!(attempt, error = %e, "Retry budget exhausted");
                    return Err(e);
                }
                Err(e) => {
                    let delay = e.retry_after().unwrap_or_else(|| self.delay_for(attempt));
                    debug!(attempt, ?delay, error = %e, "Transient failure, backing off");

                    let mut cancel_wait = cancel.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel_wait.cancelled() => return Err(LlmError::Cancelled),
                    }
                }
            }
        }
    }
}
