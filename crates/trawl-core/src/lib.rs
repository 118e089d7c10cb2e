pub mod broadcast;
pub mod cache;
pub mod config;
pub mod error;
pub mod job;
pub mod models;
pub mod orchestrator;
pub mod rate_limit;
pub mod retry;
pub mod store;
#[doc(hidden)]
pub mod testutil;
pub mod traits;

pub use broadcast::{Broadcaster, ProgressEvent, Subscription};
pub use cache::{CacheTtls, MemoryCache, cache_key};
pub use config::OrchestratorConfig;
pub use error::AppError;
pub use job::{Job, JobParams, JobStatus, Platform, ScrapedItem, StartJobRequest};
pub use models::{PlatformStats, StatsSnapshot, compute_hash};
pub use orchestrator::{JobEvent, JobReporter, Orchestrator, TracingJobReporter};
pub use rate_limit::{RateLimitConfig, RateLimiter, RateLimiters};
pub use retry::{RetryPolicy, run_with_retry, run_with_retry_if};
pub use store::MemoryContentStore;
pub use traits::{ContentStore, Extractor, ExtractorRegistry, NullStore, ResultCache};
