//! Per-platform token bucket throttling.
//!
//! Each platform gets its own [`RateLimiter`], so a saturated source never
//! stalls jobs for another one. Tokens refill continuously at
//! `capacity / period` and are recomputed lazily on every `acquire`; there is
//! no background ticker.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use trawl_core::rate_limit::{RateLimitConfig, RateLimiter};
//!
//! # async fn run() -> Result<(), trawl_core::AppError> {
//! // 15 calls per 15 minutes, i.e. one token per minute once the burst is spent
//! let limiter = RateLimiter::new(RateLimitConfig::new(15, Duration::from_secs(900)))?;
//! limiter.acquire().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::AppError;
use crate::job::Platform;

/// Longest accepted refill period.
pub const MAX_PERIOD: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Sizing of a token bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Maximum number of tokens (burst size).
    pub capacity: u32,

    /// Time it takes to refill an empty bucket.
    pub period: Duration,
}

impl RateLimitConfig {
    pub fn new(capacity: u32, period: Duration) -> Self {
        Self { capacity, period }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.capacity == 0 {
            return Err(AppError::ConfigError(
                "rate limiter capacity must be at least 1".into(),
            ));
        }
        if self.period.is_zero() {
            return Err(AppError::ConfigError(
                "rate limiter period must be greater than zero".into(),
            ));
        }
        if self.period > MAX_PERIOD {
            return Err(AppError::ConfigError(format!(
                "rate limiter period must be at most {}s, got {}s",
                MAX_PERIOD.as_secs(),
                self.period.as_secs()
            )));
        }
        Ok(())
    }

    fn refill_rate_per_sec(&self) -> f64 {
        f64::from(self.capacity) / self.period.as_secs_f64()
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, capacity: f64, rate: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

/// Continuous-refill token bucket.
///
/// The bucket state sits behind an async mutex that stays locked while a
/// caller waits for its token, so concurrent callers are served one at a time
/// in lock order.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a full bucket. Fails on zero capacity or zero period.
    pub fn new(config: RateLimitConfig) -> Result<Self, AppError> {
        Self::named("default", config)
    }

    pub fn named(name: impl Into<String>, config: RateLimitConfig) -> Result<Self, AppError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(config.capacity),
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Wait until a token is available, then take it. Never fails.
    pub async fn acquire(&self) {
        let capacity = f64::from(self.config.capacity);
        let rate = self.config.refill_rate_per_sec();

        let mut bucket = self.bucket.lock().await;
        bucket.refill(capacity, rate);

        if bucket.tokens < 1.0 {
            // Bounded by the validated period, so the conversion cannot overflow.
            let wait = Duration::try_from_secs_f64((1.0 - bucket.tokens) / rate)
                .unwrap_or(self.config.period);
            tracing::debug!(
                limiter = %self.name,
                wait_ms = %wait.as_millis(),
                "Rate limit reached, waiting for token"
            );
            tokio::time::sleep(wait).await;
            bucket.tokens = 1.0;
            bucket.last_refill = Instant::now();
        }

        bucket.tokens -= 1.0;
    }

    /// Current token count after a lazy refill.
    pub async fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(
            f64::from(self.config.capacity),
            self.config.refill_rate_per_sec(),
        );
        bucket.tokens
    }
}

/// Limiters keyed by platform, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct RateLimiters {
    limiters: HashMap<Platform, Arc<RateLimiter>>,
}

impl RateLimiters {
    /// Build one limiter per configured platform, failing on the first invalid config.
    pub fn from_configs(configs: &HashMap<Platform, RateLimitConfig>) -> Result<Self, AppError> {
        let mut limiters = HashMap::with_capacity(configs.len());
        for (platform, config) in configs {
            let limiter = RateLimiter::named(platform.as_str(), *config).map_err(|e| {
                AppError::ConfigError(format!("invalid rate limit for {platform}: {e}"))
            })?;
            limiters.insert(*platform, Arc::new(limiter));
        }
        Ok(Self { limiters })
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<RateLimiter>> {
        self.limiters.get(&platform).cloned()
    }
}
