use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::compute_hash;

/// Extra query parameters of a job. Ordered so that serialisation is canonical.
pub type JobParams = BTreeMap<String, serde_json::Value>;

/// Smallest and largest item limit accepted for a single job.
pub const MIN_LIMIT: u32 = 1;
pub const MAX_LIMIT: u32 = 100;

/// Source platform a job harvests from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitter,
    Reddit,
    Youtube,
    Instagram,
    Tiktok,
    Web,
}

impl Platform {
    pub const ALL: [Platform; 6] = [
        Platform::Twitter,
        Platform::Reddit,
        Platform::Youtube,
        Platform::Instagram,
        Platform::Tiktok,
        Platform::Web,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Twitter => "twitter",
            Platform::Reddit => "reddit",
            Platform::Youtube => "youtube",
            Platform::Instagram => "instagram",
            Platform::Tiktok => "tiktok",
            Platform::Web => "web",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "twitter" | "x" => Ok(Platform::Twitter),
            "reddit" => Ok(Platform::Reddit),
            "youtube" => Ok(Platform::Youtube),
            "instagram" => Ok(Platform::Instagram),
            "tiktok" => Ok(Platform::Tiktok),
            "web" => Ok(Platform::Web),
            _ => Err(format!("Unknown platform: {}", s)),
        }
    }
}

/// Status of a scrape job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Queued, JobStatus::Running) => true,
            (JobStatus::Queued | JobStatus::Running, s) => s.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// A single piece of harvested content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedItem {
    /// Platform-native identifier (tweet id, post id, URL).
    pub id: String,
    pub title: Option<String>,
    pub content: String,
    pub url: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ScrapedItem {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            content: content.into(),
            url: None,
            author: None,
            published_at: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// SHA-256 of the item content, used for duplicate detection.
    pub fn content_hash(&self) -> String {
        compute_hash(&self.content)
    }
}

/// Request to start a new scrape job.
#[derive(Debug, Clone)]
pub struct StartJobRequest {
    pub platform: Platform,
    pub target: String,
    pub limit: u32,
    pub params: JobParams,
}

impl StartJobRequest {
    pub fn new(platform: Platform, target: impl Into<String>, limit: u32) -> Self {
        Self {
            platform,
            target: target.into(),
            limit,
            params: JobParams::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Ask the extractor to also compute embeddings. Part of the cache key.
    pub fn with_embeddings(self, enabled: bool) -> Self {
        if enabled {
            self.with_param("extract_embeddings", serde_json::Value::Bool(true))
        } else {
            self
        }
    }
}

/// One scrape request instance and its live counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub platform: Platform,
    pub target: String,
    pub limit: u32,
    pub params: JobParams,
    pub status: JobStatus,
    pub items_scraped: u32,
    pub success_count: u32,
    pub error_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub current_item: Option<ScrapedItem>,
    pub error: Option<String>,
    pub from_cache: bool,
}

impl Job {
    pub fn new(request: &StartJobRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            platform: request.platform,
            target: request.target.clone(),
            limit: request.limit,
            params: request.params.clone(),
            status: JobStatus::Queued,
            items_scraped: 0,
            success_count: 0,
            error_count: 0,
            started_at: Utc::now(),
            finished_at: None,
            current_item: None,
            error: None,
            from_cache: false,
        }
    }

    /// Move to `next` if the state machine allows it. Terminal states are final.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }

    pub fn record_success(&mut self, item: ScrapedItem) {
        self.items_scraped += 1;
        self.success_count += 1;
        self.current_item = Some(item);
    }

    pub fn record_error(&mut self, item: ScrapedItem) {
        self.items_scraped += 1;
        self.error_count += 1;
        self.current_item = Some(item);
    }

    /// Seconds since the job started, frozen once it finishes.
    pub fn elapsed_seconds(&self) -> f64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }
}
