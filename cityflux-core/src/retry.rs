//! Bounded exponential backoff shared by the ingestors (transient transport errors) and the sink
//! writers (storage unavailable). Only errors for which [Error::is_retryable] holds are retried,
//! everything else is returned on first occurrence.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::Result;
use crate::error::Error;

/// Retry policy for one class of operations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub factor: f64,
    /// Randomization around the computed delay, between 0.0 and 1.0.
    pub jitter: f64,
    pub max_attempts: u16,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            factor: 2.0,
            jitter: 0.2,
            max_attempts: 8,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            config: self.clone(),
            attempt: 0,
        }
    }
}

/// Yields `initial * factor^(n-1)` (jittered, capped at `max_interval`) for attempts
/// `1..=max_attempts`, then `None`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: RetryConfig,
    attempt: u16,
}

impl ExponentialBackoff {
    pub fn attempt(&self) -> u16 {
        self.attempt
    }

    fn delay(&self, attempt: u16) -> Duration {
        // powi(-1) on attempt 0 would shrink the delay below the initial interval
        let exponent = i32::from(attempt.max(1) - 1);
        let base_ms = self.config.initial_interval.as_millis() as f64 * self.config.factor.powi(exponent);

        let delay_ms = if self.config.jitter > 0.0 {
            let jitter = self.config.jitter.min(1.0);
            base_ms * rand::rng().random_range(1.0 - jitter..=1.0 + jitter)
        } else {
            base_ms
        };

        Duration::from_millis(delay_ms as u64).min(self.config.max_interval)
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.delay(self.attempt))
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, the backoff is exhausted
/// or `cancel` fires. `what` names the operation in the logs.
pub async fn with_backoff<T, F, Fut>(
    what: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = config.backoff();
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => e,
            Err(e) => return Err(e),
        };

        let Some(delay) = backoff.next() else {
            warn!(what, attempts = backoff.attempt(), %error, "Retries exhausted");
            return Err(Error::RetriesExhausted {
                attempts: backoff.attempt(),
                last: Box::new(error),
            });
        };

        let retry_attempt = backoff.attempt();
        warn!(what, ?retry_attempt, ?delay, %error, "Retrying due to retryable error.");
        crate::metrics::pipeline_metrics().inc_retry(what);

        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(what, "Cancellation received, stopping retry loop");
                return Err(Error::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
