//! Fan-out of job progress events to subscribed connections.
//!
//! A connection is the sending half of a bounded `mpsc` channel. Connections
//! are either global (every event), scoped to one job, or stats streams that
//! receive a synthetic [`ProgressEvent::Stats`] on a fixed interval.
//!
//! Delivery never blocks the publisher: the matching senders are snapshotted
//! under the registry lock and then fed with `try_send` after it is released.
//! A closed or full connection is unregistered, which ends its stream once
//! the receiver has drained what was already queued.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{JobStatus, Platform, ScrapedItem};
use crate::models::{JobProgress, PlatformStats, StatsSnapshot};

/// Identifier handed out for each registered connection.
pub type ConnectionId = u64;

/// Bounds for the stats stream interval.
pub const MIN_STATS_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Immutable message describing a job state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started {
        job_id: Uuid,
        platform: Platform,
        target: String,
        limit: u32,
        timestamp: DateTime<Utc>,
    },
    Progress {
        job_id: Uuid,
        platform: Platform,
        items_scraped: u32,
        success_count: u32,
        error_count: u32,
        limit: u32,
        elapsed_seconds: f64,
    },
    ItemPreview {
        job_id: Uuid,
        platform: Platform,
        item: ScrapedItem,
    },
    Completed {
        job_id: Uuid,
        platform: Platform,
        items_scraped: u32,
        success_count: u32,
        error_count: u32,
        elapsed_seconds: f64,
        from_cache: bool,
    },
    Error {
        job_id: Uuid,
        platform: Platform,
        message: String,
        items_scraped: u32,
    },
    Cancelled {
        job_id: Uuid,
        platform: Platform,
        items_scraped: u32,
    },
    Stats {
        #[serde(flatten)]
        snapshot: StatsSnapshot,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            ProgressEvent::Started { job_id, .. }
            | ProgressEvent::Progress { job_id, .. }
            | ProgressEvent::ItemPreview { job_id, .. }
            | ProgressEvent::Completed { job_id, .. }
            | ProgressEvent::Error { job_id, .. }
            | ProgressEvent::Cancelled { job_id, .. } => Some(*job_id),
            ProgressEvent::Stats { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::Started { .. } => "started",
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::ItemPreview { .. } => "item_preview",
            ProgressEvent::Completed { .. } => "completed",
            ProgressEvent::Error { .. } => "error",
            ProgressEvent::Cancelled { .. } => "cancelled",
            ProgressEvent::Stats { .. } => "stats",
        }
    }

    /// Whether this is the last event a job emits.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Completed { .. }
                | ProgressEvent::Error { .. }
                | ProgressEvent::Cancelled { .. }
        )
    }
}

/// Receiving side of a registration made through [`Broadcaster::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    pub id: ConnectionId,
    pub events: mpsc::Receiver<ProgressEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.events.recv().await
    }
}

/// Introspection payload of the broadcaster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcasterStatus {
    pub active_connections: usize,
    pub active_jobs: usize,
    /// Number of scoped connections per job id.
    pub job_subscriptions: HashMap<Uuid, usize>,
    pub platform_stats: BTreeMap<Platform, PlatformStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Global,
    Job(Uuid),
    Stats,
}

#[derive(Debug)]
struct Connection {
    sender: mpsc::Sender<ProgressEvent>,
    scope: Scope,
    stop: Option<CancellationToken>,
}

#[derive(Debug, Default)]
struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    job_subscriptions: HashMap<Uuid, HashSet<ConnectionId>>,
    tracked_jobs: HashMap<Uuid, JobProgress>,
}

impl Registry {
    fn track(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Started {
                job_id,
                platform,
                target,
                limit,
                timestamp,
            } => {
                self.tracked_jobs.insert(
                    *job_id,
                    JobProgress {
                        job_id: *job_id,
                        platform: *platform,
                        target: target.clone(),
                        status: JobStatus::Running,
                        limit: *limit,
                        items_scraped: 0,
                        success_count: 0,
                        error_count: 0,
                        started_at: *timestamp,
                    },
                );
            }
            ProgressEvent::Progress {
                job_id,
                items_scraped,
                success_count,
                error_count,
                ..
            } => {
                if let Some(job) = self.tracked_jobs.get_mut(job_id) {
                    job.items_scraped = *items_scraped;
                    job.success_count = *success_count;
                    job.error_count = *error_count;
                }
            }
            ProgressEvent::Completed { job_id, .. }
            | ProgressEvent::Error { job_id, .. }
            | ProgressEvent::Cancelled { job_id, .. } => {
                self.tracked_jobs.remove(job_id);
            }
            ProgressEvent::ItemPreview { .. } | ProgressEvent::Stats { .. } => {}
        }
    }

    fn recipients(&self, event: &ProgressEvent) -> Vec<(ConnectionId, mpsc::Sender<ProgressEvent>)> {
        let mut recipients: Vec<_> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.scope == Scope::Global)
            .map(|(id, conn)| (*id, conn.sender.clone()))
            .collect();

        if let Some(ids) = event.job_id().and_then(|j| self.job_subscriptions.get(&j)) {
            recipients.extend(
                ids.iter()
                    .filter_map(|id| self.connections.get(id).map(|c| (*id, c.sender.clone()))),
            );
        }
        recipients
    }

    fn platform_stats(&self) -> BTreeMap<Platform, PlatformStats> {
        let mut stats: BTreeMap<Platform, PlatformStats> = BTreeMap::new();
        for job in self.tracked_jobs.values() {
            let entry = stats.entry(job.platform).or_default();
            entry.active_jobs += 1;
            entry.items_scraped += u64::from(job.items_scraped);
            entry.success_count += u64::from(job.success_count);
            entry.error_count += u64::from(job.error_count);
        }
        stats
    }
}

/// Registry of subscriber connections plus the job state derived from events.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU64>,
    buffer: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Broadcaster {
    /// `buffer` is the per-connection channel capacity used by [`subscribe`](Self::subscribe).
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned broadcaster registry");
            poisoned.into_inner()
        })
    }

    fn insert(&self, connection: Connection) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.lock();
        if let Scope::Job(job_id) = connection.scope {
            registry.job_subscriptions.entry(job_id).or_default().insert(id);
        }
        registry.connections.insert(id, connection);
        id
    }

    /// Register an externally created channel. `job_id = None` receives every event.
    pub fn register(
        &self,
        sender: mpsc::Sender<ProgressEvent>,
        job_id: Option<Uuid>,
    ) -> ConnectionId {
        let scope = job_id.map_or(Scope::Global, Scope::Job);
        let id = self.insert(Connection {
            sender,
            scope,
            stop: None,
        });
        tracing::debug!(connection_id = id, ?job_id, "Subscriber registered");
        id
    }

    /// Create a channel and register it.
    pub fn subscribe(&self, job_id: Option<Uuid>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.register(tx, job_id);
        Subscription { id, events: rx }
    }

    /// Open a stats stream that emits a snapshot every `interval` (1–60s)
    /// until the receiver is dropped or the connection is unsubscribed.
    pub fn subscribe_stats(&self, interval: Duration) -> Result<Subscription, AppError> {
        if !(MIN_STATS_INTERVAL..=MAX_STATS_INTERVAL).contains(&interval) {
            return Err(AppError::InvalidRequest(format!(
                "stats interval must be between {}s and {}s",
                MIN_STATS_INTERVAL.as_secs(),
                MAX_STATS_INTERVAL.as_secs()
            )));
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        let stop = CancellationToken::new();
        let id = self.insert(Connection {
            sender: tx.clone(),
            scope: Scope::Stats,
            stop: Some(stop.clone()),
        });

        let broadcaster = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = stop.cancelled() => break,
                    () = tx.closed() => break,
                }

                let event = ProgressEvent::Stats {
                    snapshot: broadcaster.stats_snapshot(),
                    timestamp: Utc::now(),
                };
                match tx.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::debug!(connection_id = id, "Stats subscriber lagging, skipped tick");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            broadcaster.unsubscribe(id);
        });

        tracing::debug!(connection_id = id, interval_secs = interval.as_secs(), "Stats subscriber registered");
        Ok(Subscription { id, events: rx })
    }

    /// Remove a connection from every registry. Safe to call repeatedly.
    pub fn unsubscribe(&self, id: ConnectionId) -> bool {
        let mut registry = self.lock();
        let Some(connection) = registry.connections.remove(&id) else {
            return false;
        };

        if let Scope::Job(job_id) = connection.scope
            && let Some(ids) = registry.job_subscriptions.get_mut(&job_id)
        {
            ids.remove(&id);
            if ids.is_empty() {
                registry.job_subscriptions.remove(&job_id);
            }
        }
        if let Some(stop) = connection.stop {
            stop.cancel();
        }
        drop(registry);

        tracing::debug!(connection_id = id, "Subscriber removed");
        true
    }

    /// Deliver `event` to all global subscribers and to subscribers of its job.
    pub fn publish(&self, event: ProgressEvent) {
        let recipients = {
            let mut registry = self.lock();
            registry.track(&event);
            registry.recipients(&event)
        };

        for (id, sender) in recipients {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // The receiver drains what it has, then sees end of stream.
                    tracing::warn!(
                        connection_id = id,
                        kind = event.kind(),
                        "Subscriber buffer full, removing"
                    );
                    self.unsubscribe(id);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::info!(connection_id = id, "Subscriber disconnected, removing");
                    self.unsubscribe(id);
                }
            }
        }
    }

    pub fn platform_stats(&self) -> BTreeMap<Platform, PlatformStats> {
        self.lock().platform_stats()
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let registry = self.lock();
        let mut active_jobs: Vec<JobProgress> = registry.tracked_jobs.values().cloned().collect();
        active_jobs.sort_by_key(|j| j.started_at);
        StatsSnapshot {
            platform_stats: registry.platform_stats(),
            active_jobs_count: active_jobs.len(),
            active_jobs,
        }
    }

    pub fn status(&self) -> BroadcasterStatus {
        let registry = self.lock();
        BroadcasterStatus {
            active_connections: registry.connections.len(),
            active_jobs: registry.tracked_jobs.len(),
            job_subscriptions: registry
                .job_subscriptions
                .iter()
                .map(|(job_id, ids)| (*job_id, ids.len()))
                .collect(),
            platform_stats: registry.platform_stats(),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(job_id: Uuid, platform: Platform) -> ProgressEvent {
        ProgressEvent::Started {
            job_id,
            platform,
            target: "t".into(),
            limit: 10,
            timestamp: Utc::now(),
        }
    }

    fn progress(job_id: Uuid, n: u32) -> ProgressEvent {
        ProgressEvent::Progress {
            job_id,
            platform: Platform::Twitter,
            items_scraped: n,
            success_count: n,
            error_count: 0,
            limit: 10,
            elapsed_seconds: 0.0,
        }
    }

    #[tokio::test]
    async fn scoped_subscribers_only_see_their_job() {
        let hub = Broadcaster::default();
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        let mut global = hub.subscribe(None);
        let mut scoped = hub.subscribe(Some(x));

        hub.publish(progress(y, 1));
        hub.publish(progress(x, 1));

        assert_eq!(global.recv().await.unwrap().job_id(), Some(y));
        assert_eq!(global.recv().await.unwrap().job_id(), Some(x));
        assert_eq!(scoped.recv().await.unwrap().job_id(), Some(x));
        assert!(scoped.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let hub = Broadcaster::default();
        let job = Uuid::new_v4();
        let mut sub = hub.subscribe(Some(job));
        for n in 1..=50 {
            hub.publish(progress(job, n));
        }
        for n in 1..=50 {
            match sub.recv().await.unwrap() {
                ProgressEvent::Progress { items_scraped, .. } => assert_eq!(items_scraped, n),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn closed_connection_is_removed_without_affecting_others() {
        let hub = Broadcaster::default();
        let job = Uuid::new_v4();
        let dropped = hub.subscribe(None);
        let mut alive = hub.subscribe(None);
        drop(dropped);

        hub.publish(progress(job, 1));

        assert!(alive.recv().await.is_some());
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn full_buffer_removes_only_that_subscriber() {
        let hub = Broadcaster::new(1);
        let job = Uuid::new_v4();
        let mut slow = hub.subscribe(None);
        let mut fast = hub.subscribe(None);

        hub.publish(progress(job, 1));
        assert!(fast.recv().await.is_some());
        hub.publish(progress(job, 2));

        assert!(fast.recv().await.is_some());
        assert_eq!(hub.connection_count(), 1);

        // The queued event is still delivered, then the stream ends.
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_none());

        hub.publish(progress(job, 3));
        assert!(fast.recv().await.is_some());
    }

    #[tokio::test]
    async fn lagging_job_subscriber_sees_end_of_stream_instead_of_a_gap() {
        let hub = Broadcaster::new(1);
        let job = Uuid::new_v4();
        let mut sub = hub.subscribe(Some(job));

        hub.publish(progress(job, 1));
        hub.publish(ProgressEvent::Completed {
            job_id: job,
            platform: Platform::Twitter,
            items_scraped: 1,
            success_count: 1,
            error_count: 0,
            elapsed_seconds: 0.1,
            from_cache: false,
        });

        assert_eq!(sub.recv().await.unwrap().kind(), "progress");
        assert!(sub.recv().await.is_none());
        assert_eq!(hub.connection_count(), 0);
        assert!(hub.status().job_subscriptions.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let hub = Broadcaster::default();
        let job = Uuid::new_v4();
        let sub = hub.subscribe(Some(job));

        assert!(hub.unsubscribe(sub.id));
        assert!(!hub.unsubscribe(sub.id));
        assert!(!hub.unsubscribe(9_999));
        assert!(hub.status().job_subscriptions.is_empty());
    }

    #[test]
    fn stats_follow_tracked_jobs() {
        let hub = Broadcaster::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        hub.publish(started(a, Platform::Twitter));
        hub.publish(started(b, Platform::Reddit));
        hub.publish(progress(a, 3));

        let stats = hub.platform_stats();
        assert_eq!(stats[&Platform::Twitter].active_jobs, 1);
        assert_eq!(stats[&Platform::Twitter].success_count, 3);
        assert_eq!(stats[&Platform::Reddit].items_scraped, 0);

        hub.publish(ProgressEvent::Cancelled {
            job_id: a,
            platform: Platform::Twitter,
            items_scraped: 3,
        });
        let snapshot = hub.stats_snapshot();
        assert_eq!(snapshot.active_jobs_count, 1);
        assert_eq!(snapshot.active_jobs[0].job_id, b);
        assert!(!snapshot.platform_stats.contains_key(&Platform::Twitter));
    }

    #[test]
    fn status_counts_connections_and_subscriptions() {
        let hub = Broadcaster::default();
        let job = Uuid::new_v4();
        let _g = hub.subscribe(None);
        let _s1 = hub.subscribe(Some(job));
        let _s2 = hub.subscribe(Some(job));

        let status = hub.status();
        assert_eq!(status.active_connections, 3);
        assert_eq!(status.job_subscriptions.get(&job), Some(&2));
    }

    #[test]
    fn stats_interval_is_bounded() {
        let hub = Broadcaster::default();
        assert!(hub.subscribe_stats(Duration::ZERO).is_err());
        assert!(hub.subscribe_stats(Duration::from_secs(61)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stats_stream_ticks_until_dropped() {
        let hub = Broadcaster::default();
        hub.publish(started(Uuid::new_v4(), Platform::Youtube));
        let mut stats = hub.subscribe_stats(Duration::from_secs(5)).unwrap();

        for _ in 0..3 {
            match stats.recv().await.unwrap() {
                ProgressEvent::Stats { snapshot, .. } => assert_eq!(snapshot.active_jobs_count, 1),
                other => panic!("unexpected event {other:?}"),
            }
        }

        // Stats connections never receive job events.
        hub.publish(progress(Uuid::new_v4(), 1));
        let id = stats.id;
        drop(stats);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!hub.unsubscribe(id));
        assert_eq!(hub.connection_count(), 0);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let job = Uuid::new_v4();
        let json = serde_json::to_value(progress(job, 2)).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["items_scraped"], 2);

        let stats = ProgressEvent::Stats {
            snapshot: Broadcaster::default().stats_snapshot(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["type"], "stats");
        assert_eq!(json["active_jobs_count"], 0);
    }
}
