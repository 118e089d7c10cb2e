//! In-memory result cache with per-entry TTL.
//!
//! Keys are namespaced by platform and derived from a canonical, sorted
//! serialisation of the query, so identical queries always land on the same
//! entry. Expired entries read as absent; [`ResultCache::sweep`] purges them
//! eagerly.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::future::Cache;

use crate::error::AppError;
use crate::job::{JobParams, Platform, ScrapedItem};
use crate::models::compute_hash;
use crate::traits::ResultCache;

/// Derive the cache key for a query.
///
/// `target` is merged into the parameter set before serialising; the map is
/// ordered, so insertion order never affects the key.
pub fn cache_key(platform: Platform, target: &str, params: &JobParams) -> String {
    let mut canonical: BTreeMap<&str, &serde_json::Value> =
        params.iter().map(|(k, v)| (k.as_str(), v)).collect();
    let target = serde_json::Value::String(target.to_string());
    canonical.insert("target", &target);

    // BTreeMap serialisation of strings and JSON values cannot fail.
    let serialized = serde_json::to_string(&canonical).unwrap_or_default();
    format!("{}:{}", platform, compute_hash(&serialized))
}

/// Default time-to-live per platform.
///
/// Feeds go stale quickly; transcripts and static pages do not.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheTtls {
    ttls: HashMap<Platform, Duration>,
    fallback: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        let ttls = HashMap::from([
            (Platform::Twitter, Duration::from_secs(15 * 60)),
            (Platform::Instagram, Duration::from_secs(30 * 60)),
            (Platform::Tiktok, Duration::from_secs(30 * 60)),
            (Platform::Reddit, Duration::from_secs(60 * 60)),
            (Platform::Web, Duration::from_secs(6 * 60 * 60)),
            (Platform::Youtube, Duration::from_secs(24 * 60 * 60)),
        ]);
        Self {
            ttls,
            fallback: Duration::from_secs(60 * 60),
        }
    }
}

impl CacheTtls {
    pub fn with_ttl(mut self, platform: Platform, ttl: Duration) -> Self {
        self.ttls.insert(platform, ttl);
        self
    }

    pub fn ttl_for(&self, platform: Platform) -> Duration {
        self.ttls.get(&platform).copied().unwrap_or(self.fallback)
    }
}

#[derive(Debug, Clone)]
struct CachedEntry {
    items: Arc<Vec<ScrapedItem>>,
    ttl: Duration,
}

struct EntryExpiry;

impl Expiry<String, CachedEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// [`ResultCache`] backed by a bounded moka cache.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Cache<String, CachedEntry>,
    ttls: CacheTtls,
}

impl MemoryCache {
    pub fn new(max_entries: u64, ttls: CacheTtls) -> Self {
        let inner = Cache::builder()
            .name("trawl-results")
            .max_capacity(max_entries)
            .expire_after(EntryExpiry)
            .build();
        Self { inner, ttls }
    }

    pub fn ttls(&self) -> &CacheTtls {
        &self.ttls
    }

    /// Approximate number of live entries.
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(10_000, CacheTtls::default())
    }
}

impl ResultCache for MemoryCache {
    async fn get(
        &self,
        platform: Platform,
        target: &str,
        params: &JobParams,
    ) -> Result<Option<Vec<ScrapedItem>>, AppError> {
        let key = cache_key(platform, target, params);
        let hit = self.inner.get(&key).await;
        tracing::debug!(%platform, source = %target, hit = hit.is_some(), "Cache lookup");
        Ok(hit.map(|entry| entry.items.as_ref().clone()))
    }

    async fn set(
        &self,
        platform: Platform,
        target: &str,
        params: &JobParams,
        items: &[ScrapedItem],
        ttl: Option<Duration>,
    ) -> Result<(), AppError> {
        if items.is_empty() {
            tracing::debug!(%platform, source = %target, "Skipping cache write for empty result");
            return Ok(());
        }

        let ttl = ttl.unwrap_or_else(|| self.ttls.ttl_for(platform));
        let entry = CachedEntry {
            items: Arc::new(items.to_vec()),
            ttl,
        };
        self.inner
            .insert(cache_key(platform, target, params), entry)
            .await;
        tracing::debug!(%platform, source = %target, count = items.len(), ttl_secs = ttl.as_secs(), "Cached result");
        Ok(())
    }

    async fn invalidate(
        &self,
        platform: Platform,
        target: &str,
        params: &JobParams,
    ) -> Result<bool, AppError> {
        let key = cache_key(platform, target, params);
        Ok(self.inner.remove(&key).await.is_some())
    }

    async fn invalidate_all(&self, platform: Platform) -> Result<u64, AppError> {
        let prefix = format!("{platform}:");
        let keys: Vec<Arc<String>> = self
            .inner
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key)
            .collect();

        for key in &keys {
            self.inner.invalidate(key.as_str()).await;
        }

        tracing::info!(%platform, removed = keys.len(), "Invalidated platform cache");
        Ok(keys.len() as u64)
    }

    async fn sweep(&self) -> Result<(), AppError> {
        self.inner.run_pending_tasks().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: usize) -> Vec<ScrapedItem> {
        (0..n)
            .map(|i| ScrapedItem::new(i.to_string(), format!("item {i}")))
            .collect()
    }

    fn params(pairs: &[(&str, serde_json::Value)]) -> JobParams {
        let mut p = JobParams::new();
        for (k, v) in pairs {
            p.insert((*k).to_string(), v.clone());
        }
        p
    }

    #[test]
    fn key_ignores_insertion_order() {
        let a = params(&[("sort", "new".into()), ("limit", 5.into()), ("lang", "en".into())]);
        let b = params(&[("lang", "en".into()), ("sort", "new".into()), ("limit", 5.into())]);
        assert_eq!(
            cache_key(Platform::Reddit, "r/rust", &a),
            cache_key(Platform::Reddit, "r/rust", &b)
        );
    }

    #[test]
    fn key_is_namespaced_and_distinct() {
        let p = JobParams::new();
        let twitter = cache_key(Platform::Twitter, "@acct", &p);
        let reddit = cache_key(Platform::Reddit, "@acct", &p);
        assert!(twitter.starts_with("twitter:"));
        assert_ne!(twitter, reddit);
        assert_ne!(twitter, cache_key(Platform::Twitter, "@other", &p));
        assert_ne!(
            twitter,
            cache_key(Platform::Twitter, "@acct", &params(&[("limit", 10.into())]))
        );
    }

    #[test]
    fn default_ttls_reflect_volatility() {
        let ttls = CacheTtls::default();
        assert!(ttls.ttl_for(Platform::Twitter) < ttls.ttl_for(Platform::Youtube));
        let custom = ttls.with_ttl(Platform::Twitter, Duration::from_secs(5));
        assert_eq!(custom.ttl_for(Platform::Twitter), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn set_then_get_returns_items_in_order() {
        let cache = MemoryCache::default();
        let p = JobParams::new();
        cache
            .set(Platform::Twitter, "@acct", &p, &items(3), None)
            .await
            .unwrap();

        let hit = cache.get(Platform::Twitter, "@acct", &p).await.unwrap();
        assert_eq!(hit, Some(items(3)));
    }

    #[tokio::test]
    async fn empty_results_are_not_cached() {
        let cache = MemoryCache::default();
        let p = JobParams::new();
        cache
            .set(Platform::Twitter, "@acct", &p, &[], None)
            .await
            .unwrap();
        assert_eq!(cache.get(Platform::Twitter, "@acct", &p).await.unwrap(), None);
    }

    #[tokio::test]
    async fn custom_ttl_expires_entry() {
        let cache = MemoryCache::default();
        let p = JobParams::new();
        cache
            .set(
                Platform::Youtube,
                "vid",
                &p,
                &items(1),
                Some(Duration::from_millis(100)),
            )
            .await
            .unwrap();

        assert!(cache.get(Platform::Youtube, "vid", &p).await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(cache.get(Platform::Youtube, "vid", &p).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn platform_default_ttl_applies() {
        let ttls = CacheTtls::default().with_ttl(Platform::Tiktok, Duration::from_millis(100));
        let cache = MemoryCache::new(100, ttls);
        let p = JobParams::new();
        cache
            .set(Platform::Tiktok, "@dance", &p, &items(2), None)
            .await
            .unwrap();
        cache
            .set(Platform::Reddit, "r/rust", &p, &items(2), None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(cache.get(Platform::Tiktok, "@dance", &p).await.unwrap().is_none());
        assert!(cache.get(Platform::Reddit, "r/rust", &p).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalidate_reports_removal() {
        let cache = MemoryCache::default();
        let p = JobParams::new();
        cache
            .set(Platform::Reddit, "r/rust", &p, &items(1), None)
            .await
            .unwrap();

        assert!(cache.invalidate(Platform::Reddit, "r/rust", &p).await.unwrap());
        assert!(!cache.invalidate(Platform::Reddit, "r/rust", &p).await.unwrap());
        assert!(cache.get(Platform::Reddit, "r/rust", &p).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalidate_all_only_touches_one_platform() {
        let cache = MemoryCache::default();
        let p = JobParams::new();
        for target in ["a", "b", "c"] {
            cache
                .set(Platform::Twitter, target, &p, &items(1), None)
                .await
                .unwrap();
        }
        cache
            .set(Platform::Reddit, "a", &p, &items(1), None)
            .await
            .unwrap();

        assert_eq!(cache.invalidate_all(Platform::Twitter).await.unwrap(), 3);
        assert!(cache.get(Platform::Twitter, "b", &p).await.unwrap().is_none());
        assert!(cache.get(Platform::Reddit, "a", &p).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_purges_expired_entries() {
        let cache = MemoryCache::default();
        let p = JobParams::new();
        cache
            .set(Platform::Web, "x", &p, &items(1), Some(Duration::from_millis(50)))
            .await
            .unwrap();
        cache.sweep().await.unwrap();
        assert_eq!(cache.entry_count(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        cache.sweep().await.unwrap();
        assert_eq!(cache.entry_count(), 0);
    }
}
