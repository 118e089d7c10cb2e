use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use trawl_core::broadcast::BroadcasterStatus;
use trawl_core::job::{Job, JobParams, Platform, StartJobRequest};
use trawl_core::models::PlatformStats;
use trawl_core::{AppError, ScrapedItem};

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateJobRequest {
    /// One of `twitter`, `reddit`, `youtube`, `instagram`, `tiktok`, `web`.
    pub platform: String,
    /// Account handle, subreddit, video id or URL depending on the platform.
    pub target: String,
    /// Maximum items to harvest (1-100).
    pub limit: u32,
    pub extract_embeddings: Option<bool>,
    #[schema(value_type = Option<Object>)]
    pub params: Option<JobParams>,
}

impl CreateJobRequest {
    pub fn into_start_request(self) -> Result<StartJobRequest, AppError> {
        let platform: Platform = self.platform.parse().map_err(AppError::InvalidRequest)?;
        let mut request = StartJobRequest::new(platform, self.target, self.limit)
            .with_embeddings(self.extract_embeddings.unwrap_or(false));
        for (key, value) in self.params.unwrap_or_default() {
            request = request.with_param(key, value);
        }
        Ok(request)
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub status: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ItemPreview {
    pub id: String,
    pub title: Option<String>,
    pub url: Option<String>,
}

impl From<&ScrapedItem> for ItemPreview {
    fn from(item: &ScrapedItem) -> Self {
        Self {
            id: item.id.clone(),
            title: item.title.clone(),
            url: item.url.clone(),
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobResponse {
    pub id: Uuid,
    pub platform: String,
    pub target: String,
    pub limit: u32,
    pub status: String,
    pub items_scraped: u32,
    pub success_count: u32,
    pub error_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: f64,
    pub from_cache: bool,
    pub error: Option<String>,
    pub current_item: Option<ItemPreview>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            platform: job.platform.to_string(),
            elapsed_seconds: job.elapsed_seconds(),
            current_item: job.current_item.as_ref().map(ItemPreview::from),
            target: job.target,
            limit: job.limit,
            status: job.status.to_string(),
            items_scraped: job.items_scraped,
            success_count: job.success_count,
            error_count: job.error_count,
            started_at: job.started_at,
            finished_at: job.finished_at,
            from_cache: job.from_cache,
            error: job.error,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub total: usize,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CancelJobResponse {
    pub job_id: Uuid,
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct InvalidateCacheResponse {
    pub platform: String,
    pub removed: u64,
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct PlatformStatsResponse {
    pub active_jobs: u32,
    pub items_scraped: u64,
    pub success_count: u64,
    pub error_count: u64,
}

impl From<PlatformStats> for PlatformStatsResponse {
    fn from(stats: PlatformStats) -> Self {
        Self {
            active_jobs: stats.active_jobs,
            items_scraped: stats.items_scraped,
            success_count: stats.success_count,
            error_count: stats.error_count,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct StatusResponse {
    pub active_connections: usize,
    pub active_jobs: usize,
    /// Scoped WebSocket connections per job id.
    pub job_subscriptions: HashMap<String, usize>,
    pub platform_stats: BTreeMap<String, PlatformStatsResponse>,
    pub supported_platforms: Vec<String>,
}

impl StatusResponse {
    pub fn new(status: BroadcasterStatus, supported: &[Platform]) -> Self {
        Self {
            active_connections: status.active_connections,
            active_jobs: status.active_jobs,
            job_subscriptions: status
                .job_subscriptions
                .into_iter()
                .map(|(id, n)| (id.to_string(), n))
                .collect(),
            platform_stats: status
                .platform_stats
                .into_iter()
                .map(|(p, s)| (p.to_string(), s.into()))
                .collect(),
            supported_platforms: supported.iter().map(Platform::to_string).collect(),
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct StatsQuery {
    /// Seconds between snapshots (1-60, default 5).
    pub interval: Option<u64>,
}

// ---------------------------------------------------------------------------
// Common
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_jobs: usize,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
