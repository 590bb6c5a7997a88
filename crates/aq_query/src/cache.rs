//! Result cache with TTL, single-flight fetches and serve-stale-on-error.
//!
//! Every key moves through `Absent -> Fetching -> Fresh -> Stale`. The first
//! request for an absent or stale key starts a detached fetch task; identical
//! requests arriving meanwhile await the same task. A caller giving up does
//! not cancel the fetch: the task still runs to completion and fills the
//! cache.

use aq_config::CacheConfig;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::QueryError;
use crate::query_spec::CacheKey;
use crate::rowset::RowSet;

type FetchResult = Result<Arc<RowSet>, QueryError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// Observable state of one cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Absent,
    Fetching,
    Fresh,
    Stale,
}

/// Rows handed out by the cache
#[derive(Debug, Clone)]
pub struct CachedRows {
    pub rows: Arc<RowSet>,
    /// Served from a stale entry because the refresh failed
    pub degraded: bool,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    rows: Arc<RowSet>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

struct InFlight {
    generation: u64,
    fetch: SharedFetch,
}

#[derive(Default)]
struct Slot {
    entry: Option<CacheEntry>,
    in_flight: Option<InFlight>,
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    joined: AtomicU64,
    stale_served: AtomicU64,
    fetches: AtomicU64,
    fetch_failures: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time copy of the cache counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Requests that awaited a fetch started by someone else
    pub joined: u64,
    pub stale_served: u64,
    pub fetches: u64,
    pub fetch_failures: u64,
    pub evictions: u64,
}

struct CacheInner {
    slots: Mutex<HashMap<CacheKey, Slot>>,
    config: CacheConfig,
    generation: AtomicU64,
    stats: CacheStats,
}

impl CacheInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a finished fetch. Results land in completion order; only the
    /// fetch that owns the in-flight marker may clear it.
    fn complete(&self, key: &CacheKey, generation: u64, result: &FetchResult) {
        let mut slots = self.lock();
        match result {
            Ok(rows) => {
                let ttl = self.config.ttl_for(key.spec().query_id.as_str());
                let slot = slots.entry(key.clone()).or_default();
                slot.entry = Some(CacheEntry {
                    rows: Arc::clone(rows),
                    expires_at: Instant::now() + ttl,
                });
                if slot
                    .in_flight
                    .as_ref()
                    .is_some_and(|f| f.generation == generation)
                {
                    slot.in_flight = None;
                }
                debug!(key = %key, rows = rows.len(), ttl_secs = ttl.as_secs(), "Cached result");
                self.evict_over_capacity(&mut slots, key);
            }
            Err(err) => {
                self.stats.fetch_failures.fetch_add(1, Ordering::Relaxed);
                info!(key = %key, error = %err, "Fetch failed");
                if let Some(slot) = slots.get_mut(key) {
                    if slot
                        .in_flight
                        .as_ref()
                        .is_some_and(|f| f.generation == generation)
                    {
                        slot.in_flight = None;
                    }
                    if slot.entry.is_none() && slot.in_flight.is_none() {
                        slots.remove(key);
                    }
                }
            }
        }
    }

    /// Drop the idle entries closest to expiry until within capacity
    fn evict_over_capacity(&self, slots: &mut HashMap<CacheKey, Slot>, keep: &CacheKey) {
        while slots.len() > self.config.max_entries {
            let victim = slots
                .iter()
                .filter(|(key, slot)| *key != keep && slot.in_flight.is_none())
                .filter_map(|(key, slot)| slot.entry.as_ref().map(|e| (key, e.expires_at)))
                .min_by_key(|(_, expires_at)| *expires_at)
                .map(|(key, _)| key.clone());

            let Some(victim) = victim else {
                break;
            };
            slots.remove(&victim);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %victim, "Evicted cache entry");
        }
    }
}

/// Shared result cache; clones share the same storage
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<CacheInner>,
}

impl ResultCache {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                slots: Mutex::new(HashMap::new()),
                config,
                generation: AtomicU64::new(0),
                stats: CacheStats::default(),
            }),
        }
    }

    /// Serve `key` from cache, or run `fetch` once for all concurrent callers.
    ///
    /// `fetch` is only invoked when this call starts a new fetch. If the
    /// fetch fails and a stale entry exists, the stale rows are returned with
    /// `degraded` set.
    ///
    /// # Errors
    ///
    /// Returns the fetch error when no stale entry can stand in for it.
    pub async fn get_or_fetch<F, Fut>(&self, key: CacheKey, fetch: F) -> Result<CachedRows, QueryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RowSet, QueryError>> + Send + 'static,
    {
        let (pending, stale) = {
            let mut slots = self.inner.lock();
            let now = Instant::now();
            let slot = slots.entry(key.clone()).or_default();

            if let Some(entry) = &slot.entry
                && entry.is_fresh(now)
            {
                self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Cache hit");
                return Ok(CachedRows {
                    rows: Arc::clone(&entry.rows),
                    degraded: false,
                });
            }

            let stale = slot.entry.clone();
            let pending = if let Some(in_flight) = &slot.in_flight {
                self.inner.stats.joined.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Joining in-flight fetch");
                in_flight.fetch.clone()
            } else {
                self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
                let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let shared = self.spawn_fetch(key.clone(), generation, fetch());
                slot.in_flight = Some(InFlight {
                    generation,
                    fetch: shared.clone(),
                });
                debug!(key = %key, generation, stale = stale.is_some(), "Started fetch");
                shared
            };
            (pending, stale)
        };

        match pending.await {
            Ok(rows) => Ok(CachedRows {
                rows,
                degraded: false,
            }),
            Err(err) => match stale {
                Some(entry) => {
                    self.inner.stats.stale_served.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %err, "Refresh failed, serving stale result");
                    Ok(CachedRows {
                        rows: entry.rows,
                        degraded: true,
                    })
                }
                None => Err(err),
            },
        }
    }

    fn spawn_fetch<Fut>(&self, key: CacheKey, generation: u64, fetch: Fut) -> SharedFetch
    where
        Fut: Future<Output = Result<RowSet, QueryError>> + Send + 'static,
    {
        self.inner.stats.fetches.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = match AssertUnwindSafe(fetch).catch_unwind().await {
                Ok(result) => result.map(Arc::new),
                Err(_) => Err(QueryError::Internal("fetch task panicked".to_string())),
            };
            inner.complete(&key, generation, &result);
            result
        });

        async move {
            task.await
                .unwrap_or_else(|err| Err(QueryError::Internal(err.to_string())))
        }
        .boxed()
        .shared()
    }

    #[must_use]
    pub fn state(&self, key: &CacheKey) -> EntryState {
        let slots = self.inner.lock();
        match slots.get(key) {
            None => EntryState::Absent,
            Some(slot) if slot.in_flight.is_some() => EntryState::Fetching,
            Some(Slot {
                entry: Some(entry), ..
            }) if entry.is_fresh(Instant::now()) => EntryState::Fresh,
            Some(Slot { entry: Some(_), .. }) => EntryState::Stale,
            Some(_) => EntryState::Absent,
        }
    }

    /// Forget `key`. A fetch still running for it will repopulate on completion.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.inner.lock().remove(key).is_some();
        if removed {
            debug!(key = %key, "Invalidated cache entry");
        }
        removed
    }

    pub fn invalidate_all(&self) -> usize {
        let mut slots = self.inner.lock();
        let n = slots.len();
        slots.clear();
        info!(entries = n, "Invalidated all cache entries");
        n
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|slot| slot.entry.is_some())
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        let s = &self.inner.stats;
        CacheStatsSnapshot {
            entries: self.len(),
            hits: s.hits.load(Ordering::Relaxed),
            misses: s.misses.load(Ordering::Relaxed),
            joined: s.joined.load(Ordering::Relaxed),
            stale_served: s.stale_served.load(Ordering::Relaxed),
            fetches: s.fetches.load(Ordering::Relaxed),
            fetch_failures: s.fetch_failures.load(Ordering::Relaxed),
            evictions: s.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_spec::QuerySpec;
    use aq_store::Row;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn key(hours: u32) -> CacheKey {
        QuerySpec::timeline_hourly(hours).unwrap().cache_key()
    }

    fn rowset(key: &CacheKey, n: usize) -> RowSet {
        let rows = (0..n)
            .map(|i| Row::new(ts(), format!("v{i}"), 1.0, 1.0, 0.0, 2.0))
            .collect();
        RowSet::validated(key.spec().clone(), ts(), rows)
    }

    fn cache() -> ResultCache {
        ResultCache::new(CacheConfig::default())
    }

    /// A fetch that sleeps, counts its runs and returns `n` rows
    fn slow_fetch(
        key: &CacheKey,
        n: usize,
        delay: Duration,
        runs: &Arc<AtomicUsize>,
    ) -> impl Future<Output = Result<RowSet, QueryError>> + Send + 'static {
        let set = rowset(key, n);
        let runs = Arc::clone(runs);
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(set)
        }
    }

    fn failing_fetch() -> impl Future<Output = Result<RowSet, QueryError>> + Send + 'static {
        async { Err(QueryError::Connection("store down".to_string())) }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_fetch() {
        let cache = cache();
        let k = key(24);
        let runs = Arc::new(AtomicUsize::new(0));

        let requests = (0..8).map(|_| {
            let cache = cache.clone();
            let k = k.clone();
            let runs = Arc::clone(&runs);
            async move {
                cache
                    .get_or_fetch(k.clone(), || slow_fetch(&k, 3, Duration::from_millis(50), &runs))
                    .await
            }
        });
        let results = futures::future::join_all(requests).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        for result in results {
            let served = result.unwrap();
            assert_eq!(served.rows.len(), 3);
            assert!(!served.degraded);
        }
        let stats = cache.stats();
        assert_eq!(stats.fetches, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.joined, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_fresh_then_stale() {
        let cache = cache();
        let k = key(24);
        let runs = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_fetch(k.clone(), || slow_fetch(&k, 1, Duration::ZERO, &runs))
            .await
            .unwrap();
        assert_eq!(cache.state(&k), EntryState::Fresh);

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.state(&k), EntryState::Fresh);
        cache
            .get_or_fetch(k.clone(), || slow_fetch(&k, 1, Duration::ZERO, &runs))
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.state(&k), EntryState::Stale);
        cache
            .get_or_fetch(k.clone(), || slow_fetch(&k, 1, Duration::ZERO, &runs))
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(cache.state(&k), EntryState::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_override_per_query() {
        let mut config = CacheConfig::default();
        config
            .ttl_overrides
            .insert("timeline_hourly".to_string(), 10);
        let cache = ResultCache::new(config);
        let k = key(24);
        let runs = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_fetch(k.clone(), || slow_fetch(&k, 1, Duration::ZERO, &runs))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.state(&k), EntryState::Stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reaches_every_waiter_and_caches_nothing() {
        let cache = cache();
        let k = key(24);

        let requests = (0..4).map(|_| {
            let cache = cache.clone();
            let k = k.clone();
            async move {
                cache
                    .get_or_fetch(k, || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(QueryError::Query("bad sql".to_string()))
                    })
                    .await
            }
        });
        for result in futures::future::join_all(requests).await {
            assert_eq!(result.unwrap_err(), QueryError::Query("bad sql".to_string()));
        }
        assert_eq!(cache.state(&k), EntryState::Absent);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().fetch_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_served_degraded_when_refresh_fails() {
        let cache = cache();
        let k = key(24);
        let runs = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_fetch(k.clone(), || slow_fetch(&k, 2, Duration::ZERO, &runs))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;

        let served = cache.get_or_fetch(k.clone(), failing_fetch).await.unwrap();
        assert!(served.degraded);
        assert_eq!(served.rows.len(), 2);
        assert_eq!(cache.state(&k), EntryState::Stale);
        assert_eq!(cache.stats().stale_served, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_caller_does_not_cancel_fetch() {
        let cache = cache();
        let k = key(24);
        let runs = Arc::new(AtomicUsize::new(0));

        let gave_up = tokio::time::timeout(
            Duration::from_millis(10),
            cache.get_or_fetch(k.clone(), || {
                slow_fetch(&k, 4, Duration::from_millis(100), &runs)
            }),
        )
        .await;
        assert!(gave_up.is_err());
        assert_eq!(cache.state(&k), EntryState::Fetching);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cache.state(&k), EntryState::Fresh);

        let served = cache
            .get_or_fetch(k.clone(), || slow_fetch(&k, 0, Duration::ZERO, &runs))
            .await
            .unwrap();
        assert_eq!(served.rows.len(), 4);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate() {
        let cache = cache();
        let k = key(24);
        let runs = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_fetch(k.clone(), || slow_fetch(&k, 1, Duration::ZERO, &runs))
            .await
            .unwrap();
        assert!(cache.invalidate(&k));
        assert!(!cache.invalidate(&k));
        assert_eq!(cache.state(&k), EntryState::Absent);

        cache
            .get_or_fetch(k.clone(), || slow_fetch(&k, 1, Duration::ZERO, &runs))
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        assert_eq!(cache.invalidate_all(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_closest_to_expiry() {
        let config = CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        };
        let cache = ResultCache::new(config);
        let runs = Arc::new(AtomicUsize::new(0));

        for hours in [1, 2, 3] {
            let k = key(hours);
            cache
                .get_or_fetch(k.clone(), || slow_fetch(&k, 1, Duration::ZERO, &runs))
                .await
                .unwrap();
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        assert_eq!(cache.state(&key(1)), EntryState::Absent);
        assert_eq!(cache.state(&key(2)), EntryState::Fresh);
        assert_eq!(cache.state(&key(3)), EntryState::Fresh);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_fetch_does_not_clear_newer_marker() {
        let cache = cache();
        let k = key(24);
        let runs = Arc::new(AtomicUsize::new(0));

        // Generation 1, abandoned by its caller and then invalidated
        let _ = tokio::time::timeout(
            Duration::from_millis(1),
            cache.get_or_fetch(k.clone(), || {
                slow_fetch(&k, 1, Duration::from_millis(100), &runs)
            }),
        )
        .await;
        cache.invalidate(&k);

        // Generation 2 outlives generation 1
        let newer = {
            let cache = cache.clone();
            let k = k.clone();
            let runs = Arc::clone(&runs);
            tokio::spawn(async move {
                cache
                    .get_or_fetch(k.clone(), || {
                        slow_fetch(&k, 2, Duration::from_millis(300), &runs)
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        // Generation 1 wrote its rows but the newer fetch is still in flight
        assert_eq!(cache.state(&k), EntryState::Fetching);

        let served = newer.await.unwrap().unwrap();
        assert_eq!(served.rows.len(), 2);
        assert_eq!(cache.state(&k), EntryState::Fresh);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_fetch_becomes_internal_error() {
        let cache = cache();
        let k = key(24);
        let err = cache
            .get_or_fetch(k.clone(), || async {
                if true {
                    panic!("boom");
                }
                Ok(RowSet::validated(
                    QuerySpec::timeline_hourly(1).unwrap(),
                    ts(),
                    Vec::new(),
                ))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Internal(_)));
        assert_eq!(cache.state(&k), EntryState::Absent);
    }
}
