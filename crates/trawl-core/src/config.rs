use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::CacheTtls;
use crate::error::AppError;
use crate::job::Platform;
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryPolicy;

/// Everything the orchestrator needs to size its limiters, cache and retries.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub rate_limits: HashMap<Platform, RateLimitConfig>,
    pub retry: RetryPolicy,
    pub cache_ttls: CacheTtls,
    pub cache_max_entries: u64,
    /// How many finished jobs stay queryable after they leave the active table.
    pub recent_jobs_capacity: u64,
    /// How long a finished job stays queryable.
    pub recent_jobs_ttl: Duration,
    /// Channel capacity for each subscriber connection.
    pub subscriber_buffer: usize,
    /// Upper bound on a whole job run. `None` disables it.
    pub job_timeout: Option<Duration>,
}

/// Default token buckets, sized after each platform's public API quotas.
pub fn default_rate_limits() -> HashMap<Platform, RateLimitConfig> {
    HashMap::from([
        (
            Platform::Twitter,
            RateLimitConfig::new(15, Duration::from_secs(15 * 60)),
        ),
        (Platform::Reddit, RateLimitConfig::new(60, Duration::from_secs(60))),
        (
            Platform::Youtube,
            RateLimitConfig::new(100, Duration::from_secs(100)),
        ),
        (
            Platform::Instagram,
            RateLimitConfig::new(200, Duration::from_secs(60 * 60)),
        ),
        (Platform::Tiktok, RateLimitConfig::new(30, Duration::from_secs(60))),
        (Platform::Web, RateLimitConfig::new(10, Duration::from_secs(10))),
    ])
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            rate_limits: default_rate_limits(),
            retry: RetryPolicy::default(),
            cache_ttls: CacheTtls::default(),
            cache_max_entries: 10_000,
            recent_jobs_capacity: 1_000,
            recent_jobs_ttl: Duration::from_secs(60 * 60),
            subscriber_buffer: 256,
            job_timeout: None,
        }
    }
}

impl OrchestratorConfig {
    /// Read configuration from environment variables, starting from defaults.
    ///
    /// - `TRAWL_RETRY_MAX_RETRIES`, `TRAWL_RETRY_BASE_DELAY_MS`,
    ///   `TRAWL_RETRY_MAX_DELAY_MS`, `TRAWL_RETRY_BACKOFF_BASE`
    /// - `TRAWL_RATE_<PLATFORM>_CAPACITY`, `TRAWL_RATE_<PLATFORM>_PERIOD_SECS`
    /// - `TRAWL_CACHE_TTL_<PLATFORM>_SECS`, `TRAWL_CACHE_MAX_ENTRIES`
    /// - `TRAWL_RECENT_JOBS_CAPACITY`, `TRAWL_SUBSCRIBER_BUFFER`, `TRAWL_JOB_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, AppError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var::<u32, _>(&lookup, "TRAWL_RETRY_MAX_RETRIES")? {
            config.retry.max_retries = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "TRAWL_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "TRAWL_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, "TRAWL_RETRY_BACKOFF_BASE")? {
            config.retry.backoff_base = v;
        }

        for platform in Platform::ALL {
            let upper = platform.as_str().to_uppercase();
            let default = config
                .rate_limits
                .get(&platform)
                .copied()
                .unwrap_or(RateLimitConfig::new(10, Duration::from_secs(10)));
            let capacity = parse_var::<u32, _>(&lookup, &format!("TRAWL_RATE_{upper}_CAPACITY"))?;
            let period = parse_var::<u64, _>(&lookup, &format!("TRAWL_RATE_{upper}_PERIOD_SECS"))?;
            if capacity.is_some() || period.is_some() {
                config.rate_limits.insert(
                    platform,
                    RateLimitConfig::new(
                        capacity.unwrap_or(default.capacity),
                        period.map(Duration::from_secs).unwrap_or(default.period),
                    ),
                );
            }

            if let Some(secs) =
                parse_var::<u64, _>(&lookup, &format!("TRAWL_CACHE_TTL_{upper}_SECS"))?
            {
                config.cache_ttls = config
                    .cache_ttls
                    .with_ttl(platform, Duration::from_secs(secs));
            }
        }

        if let Some(v) = parse_var::<u64, _>(&lookup, "TRAWL_CACHE_MAX_ENTRIES")? {
            config.cache_max_entries = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "TRAWL_RECENT_JOBS_CAPACITY")? {
            config.recent_jobs_capacity = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "TRAWL_SUBSCRIBER_BUFFER")? {
            config.subscriber_buffer = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "TRAWL_JOB_TIMEOUT_SECS")? {
            config.job_timeout = (v > 0).then(|| Duration::from_secs(v));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_limit(mut self, platform: Platform, limit: RateLimitConfig) -> Self {
        self.rate_limits.insert(platform, limit);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        self.retry.validate()?;
        for (platform, limit) in &self.rate_limits {
            limit.validate().map_err(|e| {
                AppError::ConfigError(format!("invalid rate limit for {platform}: {e}"))
            })?;
        }
        if self.subscriber_buffer == 0 {
            return Err(AppError::ConfigError(
                "TRAWL_SUBSCRIBER_BUFFER must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T, L>(lookup: &L, key: &str) -> Result<Option<T>, AppError>
where
    T: FromStr,
    L: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            AppError::ConfigError(format!("Invalid {key} '{raw}': expected a number"))
        }),
    }
}
