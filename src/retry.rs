use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    /// Double the delay after every failed attempt instead of growing it linearly.
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
            exponential: false,
        }
    }

    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            exponential: false,
        }
    }

    pub fn with_exponential_backoff(mut self, exponential: bool) -> Self {
        self.exponential = exponential;
        self
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.exponential {
            self.backoff.saturating_mul(2u32.saturating_pow(attempt))
        } else {
            self.backoff.saturating_mul(attempt.saturating_add(1))
        }
    }

    /// Run `f` until it succeeds, `should_retry` rejects the error, or retries run out.
    pub async fn retry<F, Fut, T, P>(&self, label: &str, mut f: F, should_retry: P) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&crate::error::PeargentError) -> bool,
    {
        let mut attempt = 0;
        loop {
            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.max_retries || !should_retry(&err) {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    debug!(label, attempt, ?delay, error = %err, "retrying after failure");
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
