use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{JobParams, Platform, ScrapedItem};

/// Harvests items from one platform.
///
/// Object-safe so that a registry can hold one implementation per platform.
/// Every `Err` is retried by the orchestrator except [`AppError::Permanent`]
/// and [`AppError::InvalidRequest`], which fail the job on the first attempt.
pub trait Extractor: Send + Sync {
    fn extract<'a>(
        &'a self,
        target: &'a str,
        limit: u32,
    ) -> BoxFuture<'a, Result<Vec<ScrapedItem>, AppError>>;
}

/// Maps platform names to their extractor.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    extractors: HashMap<Platform, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, platform: Platform, extractor: impl Extractor + 'static) -> Self {
        self.extractors.insert(platform, Arc::new(extractor));
        self
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn Extractor>> {
        self.extractors.get(&platform).cloned()
    }

    pub fn supports(&self, platform: Platform) -> bool {
        self.extractors.contains_key(&platform)
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<_> = self.extractors.keys().copied().collect();
        platforms.sort();
        platforms
    }
}

/// Memoizes extraction results keyed by (platform, target, params).
///
/// Fallible so that remote backends can be plugged in; the orchestrator
/// treats any error as a miss (reads) or a no-op (writes).
pub trait ResultCache: Send + Sync + Clone {
    fn get(
        &self,
        platform: Platform,
        target: &str,
        params: &JobParams,
    ) -> impl Future<Output = Result<Option<Vec<ScrapedItem>>, AppError>> + Send;

    /// Store `items`. `ttl = None` uses the platform default. Empty slices are ignored.
    fn set(
        &self,
        platform: Platform,
        target: &str,
        params: &JobParams,
        items: &[ScrapedItem],
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn invalidate(
        &self,
        platform: Platform,
        target: &str,
        params: &JobParams,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Remove every entry of `platform`. Returns how many were removed.
    fn invalidate_all(&self, platform: Platform)
    -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Purge expired entries.
    fn sweep(&self) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Persists harvested items.
pub trait ContentStore: Send + Sync + Clone {
    /// Save an item. Returns `true` if it was new content, `false` for a duplicate.
    fn create(
        &self,
        job_id: Uuid,
        platform: Platform,
        item: &ScrapedItem,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;
}

/// A no-op ContentStore for use when persistence is not needed.
#[derive(Debug, Clone)]
pub struct NullStore;

impl ContentStore for NullStore {
    async fn create(
        &self,
        _job_id: Uuid,
        _platform: Platform,
        _item: &ScrapedItem,
    ) -> Result<bool, AppError> {
        Ok(true)
    }
}
