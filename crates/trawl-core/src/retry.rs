//! Bounded exponential-backoff retry for any fallible async operation.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::error::AppError;

/// Shape of the retry schedule.
///
/// Delay before retry `n` (0-indexed) is `min(base_delay * backoff_base^n, max_delay)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_base: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    pub fn with_backoff_base(mut self, base: f64) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !self.backoff_base.is_finite() || self.backoff_base < 1.0 {
            return Err(AppError::ConfigError(format!(
                "retry backoff base must be >= 1.0, got {}",
                self.backoff_base
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(AppError::ConfigError(format!(
                "retry base delay ({:?}) exceeds max delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }

    /// Total number of attempts the executor will make.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after failed attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff_base.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Run `operation` until it succeeds or `max_retries + 1` attempts have failed.
///
/// The last error is returned unchanged.
pub async fn run_with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    run_with_retry_if(policy, operation, |_| true).await
}

/// Like [`run_with_retry`], but errors rejected by `should_retry` are returned
/// immediately without further attempts.
pub async fn run_with_retry_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let last = attempt + 1 >= max_attempts;
                if last || !should_retry(&e) {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        "Giving up after failed attempt"
                    );
                    return Err(e);
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
