//! Bounded retries for backend requests.
//!
//! Network failures, timeouts, 5xx responses and 429s are retried; every
//! other 4xx is returned immediately. A 429 that carries `Retry-After` waits
//! exactly that long instead of the exponential backoff.

use std::time::Duration;

use tiller_core::BackendError;
use tracing::warn;

use crate::classify::{classify_status, classify_transport, RequestTarget};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Wait before the attempt following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, err: &BackendError) -> Duration {
        if let Some(secs) = err.retry_after_secs() {
            return Duration::from_secs(secs).min(self.max_delay);
        }
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Send the request built by `make_request` until it succeeds or a
    /// non-retryable error (or the attempt budget) ends the loop.
    ///
    /// Only the response head is awaited here; a streamed body is consumed by
    /// the caller and is never replayed.
    pub async fn send<F>(
        &self,
        target: &RequestTarget,
        make_request: F,
    ) -> Result<reqwest::Response, BackendError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match make_request().send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let headers = response.headers().clone();
                    let body = response.text().await.unwrap_or_default();
                    target.error(classify_status(status, &headers, &body))
                }
                Err(e) => target.error(classify_transport(&e)),
            };

            if !err.is_retryable() || attempt >= self.max_attempts {
                if attempt > 1 {
                    warn!(provider = %target.provider, model = %target.model, attempt, "Giving up on backend request");
                }
                return Err(err);
            }

            let delay = self.delay_for(attempt, &err);
            warn!(
                provider = %target.provider,
                model = %target.model,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err.kind,
                "Retrying backend request"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
