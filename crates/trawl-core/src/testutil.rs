//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit and integration tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{JobParams, Platform, ScrapedItem};
use crate::orchestrator::{JobEvent, JobReporter};
use crate::traits::{ContentStore, Extractor, ResultCache};

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

/// Mock extractor with scripted responses.
///
/// Each call pops the first scripted response; once the script is exhausted
/// every call returns the fallback.
#[derive(Clone)]
pub struct MockExtractor {
    responses: Arc<Mutex<Vec<Result<Vec<ScrapedItem>, AppError>>>>,
    fallback: Result<Vec<ScrapedItem>, AppError>,
    delay: Option<Duration>,
    calls: Arc<AtomicU32>,
}

impl MockExtractor {
    /// Always returns `items`.
    pub fn new(items: Vec<ScrapedItem>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            fallback: Ok(items),
            delay: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Always fails with `error`.
    pub fn failing(error: AppError) -> Self {
        Self {
            fallback: Err(error),
            ..Self::new(Vec::new())
        }
    }

    /// Returns `responses` in order, then an empty result.
    pub fn with_responses(responses: Vec<Result<Vec<ScrapedItem>, AppError>>) -> Self {
        let extractor = Self::new(Vec::new());
        *extractor.responses.lock().unwrap() = responses;
        extractor
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times `extract` has been invoked.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Extractor for MockExtractor {
    fn extract<'a>(
        &'a self,
        _target: &'a str,
        _limit: u32,
    ) -> BoxFuture<'a, Result<Vec<ScrapedItem>, AppError>> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                self.fallback.clone()
            } else {
                responses.remove(0)
            }
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// MockStore
// ---------------------------------------------------------------------------

/// Mock content store that records every item and returns scripted outcomes.
#[derive(Clone, Default)]
pub struct MockStore {
    pub created: Arc<Mutex<Vec<(Uuid, Platform, ScrapedItem)>>>,
    outcomes: Arc<Mutex<Vec<Result<bool, AppError>>>>,
    delay: Option<Duration>,
}

impl MockStore {
    /// Every item is treated as new content.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops one outcome per call; `Ok(true)` once exhausted.
    pub fn with_outcomes(outcomes: Vec<Result<bool, AppError>>) -> Self {
        let store = Self::default();
        *store.outcomes.lock().unwrap() = outcomes;
        store
    }

    /// Sleep before saving each item.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

impl ContentStore for MockStore {
    async fn create(
        &self,
        job_id: Uuid,
        platform: Platform,
        item: &ScrapedItem,
    ) -> Result<bool, AppError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let outcome = {
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                Ok(true)
            } else {
                outcomes.remove(0)
            }
        };
        if outcome.is_ok() {
            self.created
                .lock()
                .unwrap()
                .push((job_id, platform, item.clone()));
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// FailingCache
// ---------------------------------------------------------------------------

/// Cache whose backend is always unavailable.
#[derive(Clone, Default)]
pub struct FailingCache;

impl ResultCache for FailingCache {
    async fn get(
        &self,
        _platform: Platform,
        _target: &str,
        _params: &JobParams,
    ) -> Result<Option<Vec<ScrapedItem>>, AppError> {
        Err(AppError::CacheError("backend unavailable".into()))
    }

    async fn set(
        &self,
        _platform: Platform,
        _target: &str,
        _params: &JobParams,
        _items: &[ScrapedItem],
        _ttl: Option<Duration>,
    ) -> Result<(), AppError> {
        Err(AppError::CacheError("backend unavailable".into()))
    }

    async fn invalidate(
        &self,
        _platform: Platform,
        _target: &str,
        _params: &JobParams,
    ) -> Result<bool, AppError> {
        Err(AppError::CacheError("backend unavailable".into()))
    }

    async fn invalidate_all(&self, _platform: Platform) -> Result<u64, AppError> {
        Err(AppError::CacheError("backend unavailable".into()))
    }

    async fn sweep(&self) -> Result<(), AppError> {
        Err(AppError::CacheError("backend unavailable".into()))
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock job reporter that records event labels.
#[derive(Clone, Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl JobReporter for MockReporter {
    fn report(&self, event: JobEvent<'_>) {
        let label = match &event {
            JobEvent::Started { .. } => "Started",
            JobEvent::CacheHit { .. } => "CacheHit",
            JobEvent::CacheUnavailable { .. } => "CacheUnavailable",
            JobEvent::Throttled { .. } => "Throttled",
            JobEvent::Extracted { .. } => "Extracted",
            JobEvent::CancelRequested { .. } => "CancelRequested",
            JobEvent::Finished { .. } => "Finished",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// `n` items with distinct ids and content.
pub fn make_items(n: usize) -> Vec<ScrapedItem> {
    (0..n)
        .map(|i| {
            ScrapedItem::new(format!("item-{i}"), format!("content number {i}"))
                .with_url(format!("https://example.com/{i}"))
        })
        .collect()
}
