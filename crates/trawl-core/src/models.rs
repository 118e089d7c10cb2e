use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::job::{JobStatus, Platform};

/// Aggregate counters for one platform across the currently tracked jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformStats {
    pub active_jobs: u32,
    pub items_scraped: u64,
    pub success_count: u64,
    pub error_count: u64,
}

/// Lightweight view of a job as seen by the broadcaster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: Uuid,
    pub platform: Platform,
    pub target: String,
    pub status: JobStatus,
    pub limit: u32,
    pub items_scraped: u32,
    pub success_count: u32,
    pub error_count: u32,
    pub started_at: DateTime<Utc>,
}

/// Point-in-time payload of the periodic stats stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub platform_stats: BTreeMap<Platform, PlatformStats>,
    pub active_jobs_count: usize,
    pub active_jobs: Vec<JobProgress>,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
