//! Job lifecycle: spawn, execute, cancel, and report scrape jobs.
//!
//! Each job runs as its own tokio task:
//!
//! ```text
//! cache hit? --yes--> completed (from cache)
//!     |no
//! acquire platform token -> extract (with retry) -> per item: store, progress[, preview]
//!     -> cache non-empty result -> completed
//! ```
//!
//! Cancellation is cooperative: the task checks its token at every
//! suspension point and before each item, then reports `cancelled`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::join_all;
use moka::future::Cache;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcast::{Broadcaster, BroadcasterStatus, ProgressEvent};
use crate::config::OrchestratorConfig;
use crate::error::AppError;
use crate::job::{Job, JobParams, JobStatus, MAX_LIMIT, MIN_LIMIT, Platform, StartJobRequest};
use crate::rate_limit::{RateLimiter, RateLimiters};
use crate::retry::run_with_retry_if;
use crate::traits::{ContentStore, Extractor, ExtractorRegistry, ResultCache};

/// Lifecycle notifications emitted by the orchestrator for monitoring/logging.
#[derive(Debug, Clone)]
pub enum JobEvent<'a> {
    Started { job: &'a Job },
    CacheHit { job_id: Uuid, items: usize },
    CacheUnavailable { job_id: Uuid, error: &'a AppError },
    Throttled { job_id: Uuid, platform: Platform },
    Extracted { job_id: Uuid, items: usize },
    CancelRequested { job_id: Uuid },
    Finished { job: &'a Job },
}

/// Trait for receiving orchestrator events (decoupled logging).
pub trait JobReporter: Send + Sync {
    fn report(&self, event: JobEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingJobReporter;

impl JobReporter for TracingJobReporter {
    fn report(&self, event: JobEvent<'_>) {
        match event {
            JobEvent::Started { job } => {
                tracing::info!(job_id = %job.id, platform = %job.platform, source = %job.target, limit = job.limit, "Job started");
            }
            JobEvent::CacheHit { job_id, items } => {
                tracing::info!(%job_id, items, "Served from cache");
            }
            JobEvent::CacheUnavailable { job_id, error } => {
                tracing::warn!(%job_id, %error, "Cache unavailable, continuing without it");
            }
            JobEvent::Throttled { job_id, platform } => {
                tracing::debug!(%job_id, %platform, "Acquiring rate limit token");
            }
            JobEvent::Extracted { job_id, items } => {
                tracing::debug!(%job_id, items, "Extraction returned");
            }
            JobEvent::CancelRequested { job_id } => {
                tracing::info!(%job_id, "Cancellation requested");
            }
            JobEvent::Finished { job } => match job.status {
                JobStatus::Failed => tracing::warn!(
                    job_id = %job.id,
                    error = job.error.as_deref().unwrap_or_default(),
                    items = job.items_scraped,
                    "Job failed"
                ),
                status => tracing::info!(
                    job_id = %job.id,
                    %status,
                    items = job.items_scraped,
                    success = job.success_count,
                    errors = job.error_count,
                    elapsed_secs = job.elapsed_seconds(),
                    "Job finished"
                ),
            },
        }
    }
}

/// How a job unit ended, before it is folded into the job state.
#[derive(Debug)]
enum Outcome {
    Completed,
    Failed(AppError),
    Cancelled,
}

struct ActiveJob {
    job: Job,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Owns running jobs and composes limiter, cache, retry and broadcaster around extraction.
pub struct Orchestrator<C, S>
where
    C: ResultCache,
    S: ContentStore,
{
    config: Arc<OrchestratorConfig>,
    extractors: ExtractorRegistry,
    limiters: RateLimiters,
    cache: C,
    store: S,
    broadcaster: Broadcaster,
    reporter: Arc<dyn JobReporter>,
    jobs: Arc<Mutex<HashMap<Uuid, ActiveJob>>>,
    recent: Cache<Uuid, Job>,
}

impl<C, S> Clone for Orchestrator<C, S>
where
    C: ResultCache,
    S: ContentStore,
{
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            extractors: self.extractors.clone(),
            limiters: self.limiters.clone(),
            cache: self.cache.clone(),
            store: self.store.clone(),
            broadcaster: self.broadcaster.clone(),
            reporter: self.reporter.clone(),
            jobs: self.jobs.clone(),
            recent: self.recent.clone(),
        }
    }
}

impl<C, S> Orchestrator<C, S>
where
    C: ResultCache + 'static,
    S: ContentStore + 'static,
{
    /// Build an orchestrator. Invalid limiter or retry settings fail here.
    pub fn new(
        config: OrchestratorConfig,
        extractors: ExtractorRegistry,
        cache: C,
        store: S,
        broadcaster: Broadcaster,
    ) -> Result<Self, AppError> {
        config.validate()?;
        let limiters = RateLimiters::from_configs(&config.rate_limits)?;
        let recent = Cache::builder()
            .name("trawl-recent-jobs")
            .max_capacity(config.recent_jobs_capacity)
            .time_to_live(config.recent_jobs_ttl)
            .build();

        Ok(Self {
            config: Arc::new(config),
            extractors,
            limiters,
            cache,
            store,
            broadcaster,
            reporter: Arc::new(TracingJobReporter),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            recent,
        })
    }

    pub fn with_reporter(mut self, reporter: impl JobReporter + 'static) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn supported_platforms(&self) -> Vec<Platform> {
        self.extractors.platforms()
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<Uuid, ActiveJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned job table");
            poisoned.into_inner()
        })
    }

    /// Create a job, spawn its unit of work and return its id without waiting.
    pub fn start_job(&self, request: StartJobRequest) -> Result<Uuid, AppError> {
        if !(MIN_LIMIT..=MAX_LIMIT).contains(&request.limit) {
            return Err(AppError::InvalidRequest(format!(
                "limit must be between {MIN_LIMIT} and {MAX_LIMIT}, got {}",
                request.limit
            )));
        }
        if request.target.trim().is_empty() {
            return Err(AppError::InvalidRequest("target must not be empty".into()));
        }
        let extractor = self
            .extractors
            .get(request.platform)
            .ok_or(AppError::UnsupportedPlatform(request.platform))?;
        let limiter = self.limiters.get(request.platform);

        let mut job = Job::new(&request);
        let job_id = job.id;
        let cancel = CancellationToken::new();

        job.transition(JobStatus::Running);
        self.reporter.report(JobEvent::Started { job: &job });
        let started = ProgressEvent::Started {
            job_id,
            platform: job.platform,
            target: job.target.clone(),
            limit: job.limit,
            timestamp: job.started_at,
        };

        self.lock_jobs().insert(
            job_id,
            ActiveJob {
                job,
                cancel: cancel.clone(),
                handle: None,
            },
        );
        self.broadcaster.publish(started);

        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.run_job(job_id, request, extractor, limiter, cancel)
                .await;
        });

        if let Some(entry) = self.lock_jobs().get_mut(&job_id) {
            entry.handle = Some(handle);
        }
        Ok(job_id)
    }

    /// Current snapshot of an active job, or the retained snapshot of a finished one.
    pub async fn get_job_status(&self, job_id: Uuid) -> Option<Job> {
        let active = self.lock_jobs().get(&job_id).map(|entry| entry.job.clone());
        match active {
            Some(job) => Some(job),
            None => self.recent.get(&job_id).await,
        }
    }

    /// Request cooperative cancellation. Returns `false` for unknown or finished jobs.
    pub fn cancel_job(&self, job_id: Uuid) -> bool {
        let mut jobs = self.lock_jobs();
        let Some(entry) = jobs.get_mut(&job_id) else {
            return false;
        };
        if !entry.job.transition(JobStatus::Cancelled) {
            return false;
        }
        entry.cancel.cancel();
        drop(jobs);

        self.reporter.report(JobEvent::CancelRequested { job_id });
        true
    }

    pub fn active_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .lock_jobs()
            .values()
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.started_at);
        jobs
    }

    pub fn active_job_count(&self) -> usize {
        self.lock_jobs().len()
    }

    pub fn status(&self) -> BroadcasterStatus {
        self.broadcaster.status()
    }

    /// Remove every cached result of `platform`.
    pub async fn invalidate_platform(&self, platform: Platform) -> Result<u64, AppError> {
        self.cache.invalidate_all(platform).await
    }

    /// Cancel every active job and wait for their tasks to exit.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut jobs = self.lock_jobs();
            jobs.values_mut()
                .filter_map(|entry| {
                    entry.job.transition(JobStatus::Cancelled);
                    entry.cancel.cancel();
                    entry.handle.take()
                })
                .collect()
        };

        tracing::info!(jobs = handles.len(), "Shutting down orchestrator");
        for result in join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Job task did not exit cleanly");
            }
        }
    }

    async fn run_job(
        self,
        job_id: Uuid,
        request: StartJobRequest,
        extractor: Arc<dyn Extractor>,
        limiter: Option<Arc<RateLimiter>>,
        cancel: CancellationToken,
    ) {
        let unit = AssertUnwindSafe(self.execute(job_id, &request, extractor.as_ref(), limiter, &cancel))
            .catch_unwind();

        let outcome = match self.config.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, unit).await {
                Ok(result) => result,
                Err(_) => Ok(Outcome::Failed(AppError::Timeout(limit))),
            },
            None => unit.await,
        };

        let outcome = outcome.unwrap_or_else(|_| {
            tracing::error!(%job_id, "Job task panicked");
            Outcome::Failed(AppError::Generic("job task panicked".into()))
        });

        self.finish(job_id, outcome).await;
    }

    async fn execute(
        &self,
        job_id: Uuid,
        request: &StartJobRequest,
        extractor: &dyn Extractor,
        limiter: Option<Arc<RateLimiter>>,
        cancel: &CancellationToken,
    ) -> Outcome {
        let platform = request.platform;
        let target = request.target.as_str();
        let limit = request.limit;
        let cache_params = cache_params(request);

        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        match self.cache.get(platform, target, &cache_params).await {
            Ok(Some(items)) => {
                self.reporter.report(JobEvent::CacheHit {
                    job_id,
                    items: items.len(),
                });
                self.update_job(job_id, |job| {
                    for item in items {
                        job.record_success(item);
                    }
                    job.from_cache = true;
                });
                return Outcome::Completed;
            }
            Ok(None) => {}
            Err(e) => self
                .reporter
                .report(JobEvent::CacheUnavailable { job_id, error: &e }),
        }

        if let Some(limiter) = limiter {
            self.reporter.report(JobEvent::Throttled { job_id, platform });
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Outcome::Cancelled,
                () = limiter.acquire() => {}
            }
        }

        let extracted = tokio::select! {
            biased;
            () = cancel.cancelled() => return Outcome::Cancelled,
            result = run_with_retry_if(
                &self.config.retry,
                || extractor.extract(target, limit),
                |e: &AppError| !e.is_permanent(),
            ) => result,
        };
        let mut items = match extracted {
            Ok(items) => items,
            Err(e) => return Outcome::Failed(e),
        };
        items.truncate(limit as usize);
        self.reporter.report(JobEvent::Extracted {
            job_id,
            items: items.len(),
        });

        for item in &items {
            if cancel.is_cancelled() {
                return Outcome::Cancelled;
            }

            let stored = self.store.create(job_id, platform, item).await;
            if let Err(e) = &stored {
                tracing::warn!(%job_id, item_id = %item.id, error = %e, "Failed to store item");
            }

            let progress = self.update_job(job_id, |job| {
                match stored {
                    Ok(_) => job.record_success(item.clone()),
                    Err(_) => job.record_error(item.clone()),
                }
                progress_event(job)
            });
            let Some(progress) = progress else {
                return Outcome::Cancelled;
            };
            self.broadcaster.publish(progress);

            if matches!(stored, Ok(true)) {
                self.broadcaster.publish(ProgressEvent::ItemPreview {
                    job_id,
                    platform,
                    item: item.clone(),
                });
            }
        }

        if let Err(e) = self
            .cache
            .set(platform, target, &cache_params, &items, None)
            .await
        {
            self.reporter
                .report(JobEvent::CacheUnavailable { job_id, error: &e });
        }

        Outcome::Completed
    }

    /// Apply `f` to a job that is still running. Returns `None` once the job is terminal.
    fn update_job<R>(&self, job_id: Uuid, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        let mut jobs = self.lock_jobs();
        let entry = jobs.get_mut(&job_id)?;
        if entry.job.status.is_terminal() {
            return None;
        }
        Some(f(&mut entry.job))
    }

    async fn finish(&self, job_id: Uuid, outcome: Outcome) {
        let final_job = {
            let mut jobs = self.lock_jobs();
            let Some(entry) = jobs.get_mut(&job_id) else {
                return;
            };
            let job = &mut entry.job;
            match outcome {
                Outcome::Completed => {
                    job.transition(JobStatus::Completed);
                }
                Outcome::Failed(e) => {
                    if job.transition(JobStatus::Failed) {
                        job.error = Some(e.to_string());
                    }
                }
                Outcome::Cancelled => {
                    job.transition(JobStatus::Cancelled);
                }
            }
            job.clone()
        };

        self.recent.insert(job_id, final_job.clone()).await;
        self.lock_jobs().remove(&job_id);

        self.reporter.report(JobEvent::Finished { job: &final_job });
        self.broadcaster.publish(final_event(&final_job));
    }
}

/// Parameters used for the cache key: the request params plus the limit.
fn cache_params(request: &StartJobRequest) -> JobParams {
    let mut params = request.params.clone();
    params.insert("limit".to_string(), serde_json::Value::from(request.limit));
    params
}

fn progress_event(job: &Job) -> ProgressEvent {
    ProgressEvent::Progress {
        job_id: job.id,
        platform: job.platform,
        items_scraped: job.items_scraped,
        success_count: job.success_count,
        error_count: job.error_count,
        limit: job.limit,
        elapsed_seconds: job.elapsed_seconds(),
    }
}

fn final_event(job: &Job) -> ProgressEvent {
    match job.status {
        JobStatus::Completed => ProgressEvent::Completed {
            job_id: job.id,
            platform: job.platform,
            items_scraped: job.items_scraped,
            success_count: job.success_count,
            error_count: job.error_count,
            elapsed_seconds: job.elapsed_seconds(),
            from_cache: job.from_cache,
        },
        JobStatus::Failed => ProgressEvent::Error {
            job_id: job.id,
            platform: job.platform,
            message: job.error.clone().unwrap_or_default(),
            items_scraped: job.items_scraped,
        },
        _ => ProgressEvent::Cancelled {
            job_id: job.id,
            platform: job.platform,
            items_scraped: job.items_scraped,
        },
    }
}
