//! Namespaced TTL cache in front of the service registry.
//!
//! Each namespace is a [`TtlCache`] with its own time-to-live and capacity.
//! Concurrent misses for one key share a single fetch; failed fetches are
//! never stored.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::error::AppError;
use crate::registry::HealthState;
use crate::response::ApiResponse;

/// Decimal places kept when quantizing coordinates into cache keys.
/// Two places is roughly 1 km, about the footprint of a course.
pub const COORDINATE_PRECISION: i32 = 2;

/// Lookups a namespace needs before its hit rate affects health.
pub const MIN_LOOKUPS_FOR_HIT_RATE: u64 = 20;

const DEGRADED_UTILIZATION: f64 = 0.80;
const UNHEALTHY_UTILIZATION: f64 = 0.95;
const DEGRADED_HIT_RATE: f64 = 0.3;
const UNHEALTHY_HIT_RATE: f64 = 0.1;

/// Composite key: a kind discriminator, a quantized coordinate and an
/// optional entity id. Nearby lookups collapse onto the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(kind: &str, lat: f64, lon: f64) -> Self {
        Self(format!(
            "{kind}:{:.prec$},{:.prec$}",
            quantize(lat),
            quantize(lon),
            prec = COORDINATE_PRECISION as usize
        ))
    }

    pub fn with_entity(self, entity: &str) -> Self {
        Self(format!("{}:{entity}", self.0))
    }

    pub fn current(lat: f64, lon: f64) -> Self {
        Self::new("current", lat, lon)
    }

    pub fn forecast(lat: f64, lon: f64) -> Self {
        Self::new("forecast", lat, lon)
    }

    pub fn golf(lat: f64, lon: f64, course_id: &str) -> Self {
        Self::new("golf", lat, lon).with_entity(course_id)
    }

    pub fn historical(lat: f64, lon: f64) -> Self {
        Self::new("historical", lat, lon)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> &str {
        self.0.split(':').next().unwrap_or_default()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn quantize(value: f64) -> f64 {
    let scale = 10f64.powi(COORDINATE_PRECISION);
    let rounded = (value * scale).round() / scale;
    // Avoid "-0.00" keys next to "0.00" ones.
    if rounded == 0.0 { 0.0 } else { rounded }
}

/// A stored value and its bookkeeping.
#[derive(Debug)]
pub struct CacheEntry<T> {
    pub value: T,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Request that fetched the value.
    pub origin_request_id: Uuid,
    hit_count: AtomicU64,
}

impl<T> CacheEntry<T> {
    fn new(value: T, ttl: Duration, origin_request_id: Uuid) -> Self {
        let stored_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| stored_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            value,
            stored_at,
            expires_at,
            origin_request_id,
            hit_count: AtomicU64::new(0),
        }
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.stored_at).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    fetch_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamespaceStats {
    pub name: String,
    pub entries: u64,
    pub max_entries: u64,
    pub ttl_seconds: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub stores: u64,
    pub fetch_failures: u64,
    pub utilization: f64,
    /// Rough footprint of keys and entry headers; values are not weighed.
    pub approx_memory_bytes: u64,
    pub oldest_entry_age_ms: Option<u64>,
    pub newest_entry_age_ms: Option<u64>,
}

impl NamespaceStats {
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    /// Health of this namespace and the reasons it is not healthy.
    pub fn assess(&self) -> (HealthState, Vec<String>) {
        let mut status = HealthState::Healthy;
        let mut issues = Vec::new();

        if self.utilization > UNHEALTHY_UTILIZATION {
            status = status.max(HealthState::Unhealthy);
            issues.push(format!("{}: cache nearly full", self.name));
        } else if self.utilization > DEGRADED_UTILIZATION {
            status = status.max(HealthState::Degraded);
            issues.push(format!("{}: high utilization", self.name));
        }

        if self.lookups() >= MIN_LOOKUPS_FOR_HIT_RATE {
            if self.hit_rate < UNHEALTHY_HIT_RATE {
                status = status.max(HealthState::Unhealthy);
                issues.push(format!("{}: very low hit rate", self.name));
            } else if self.hit_rate < DEGRADED_HIT_RATE {
                status = status.max(HealthState::Degraded);
                issues.push(format!("{}: low hit rate", self.name));
            }
        }

        (status, issues)
    }
}

/// One independently expiring memoization store.
#[derive(Clone)]
pub struct TtlCache<T> {
    name: Arc<str>,
    ttl: Duration,
    max_entries: u64,
    entries: Cache<String, Arc<CacheEntry<T>>>,
    counters: Arc<Counters>,
}

impl<T> TtlCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &str, ttl: Duration, max_entries: u64) -> Self {
        let entries = Cache::builder()
            .name(name)
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();
        Self {
            name: Arc::from(name),
            ttl,
            max_entries,
            entries,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// In-memory lookup. Counts as a hit or a miss.
    pub async fn get(&self, key: &str) -> Option<T> {
        self.get_entry(key).await.map(|entry| entry.value.clone())
    }

    /// Like [`TtlCache::get`] but returns the entry with its metadata.
    pub async fn get_entry(&self, key: &str) -> Option<Arc<CacheEntry<T>>> {
        match self.entries.get(key).await {
            Some(entry) => {
                entry.hit_count.fetch_add(1, Ordering::Relaxed);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(namespace = %self.name, key, "Cache hit");
                Some(entry)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(namespace = %self.name, key, "Cache miss");
                None
            }
        }
    }

    /// Presence check that does not touch the hit/miss counters.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Return the cached value, or run `fetch` and store its result.
    ///
    /// Callers that arrive while a fetch for the same key is in flight wait
    /// for it instead of starting their own, and get `cached: true`.
    /// Failures are returned to every waiter and not stored.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> ApiResponse<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let request_id = Uuid::new_v4();
        let started = Instant::now();
        let fetched = AtomicBool::new(false);
        let ttl = self.ttl;

        let init = async {
            fetched.store(true, Ordering::Relaxed);
            fetch()
                .await
                .map(|value| Arc::new(CacheEntry::new(value, ttl, request_id)))
        };
        let outcome = self.entries.try_get_with(key.to_string(), init).await;
        let fetched = fetched.load(Ordering::Relaxed);

        if fetched {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }

        let (result, cached) = match outcome {
            Ok(entry) if fetched => {
                self.counters.stores.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    namespace = %self.name,
                    key,
                    %request_id,
                    ttl_secs = ttl.as_secs(),
                    "Cache miss, stored fresh value"
                );
                (Ok(entry.value.clone()), false)
            }
            Ok(entry) => {
                entry.hit_count.fetch_add(1, Ordering::Relaxed);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(namespace = %self.name, key, "Cache hit");
                (Ok(entry.value.clone()), true)
            }
            Err(shared) => {
                self.counters.fetch_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    namespace = %self.name,
                    key,
                    error = %shared,
                    "Cache fetch failed, nothing stored"
                );
                (Err(AppError::from_shared(shared)), false)
            }
        };

        let mut response = ApiResponse::new(result, request_id);
        response.cached = cached;
        response.processing_time_ms = started.elapsed().as_millis() as u64;
        response
    }

    pub async fn insert(&self, key: &str, value: T) {
        let entry = Arc::new(CacheEntry::new(value, self.ttl, Uuid::new_v4()));
        self.entries.insert(key.to_string(), entry).await;
        self.counters.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn invalidate(&self, key: &str) {
        self.entries.invalidate(key).await;
        tracing::debug!(namespace = %self.name, key, "Cache entry invalidated");
    }

    pub async fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
        tracing::info!(namespace = %self.name, "Cache cleared");
    }

    /// Purge expired entries now rather than on the next access.
    pub async fn sweep(&self) {
        self.entries.run_pending_tasks().await;
    }

    pub async fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    pub async fn stats(&self) -> NamespaceStats {
        self.entries.run_pending_tasks().await;

        let mut approx_memory_bytes = 0u64;
        let mut oldest: Option<Duration> = None;
        let mut newest: Option<Duration> = None;
        for (key, entry) in self.entries.iter() {
            approx_memory_bytes += (key.len() + std::mem::size_of::<CacheEntry<T>>()) as u64;
            let age = entry.age();
            oldest = Some(oldest.map_or(age, |o| o.max(age)));
            newest = Some(newest.map_or(age, |n| n.min(age)));
        }

        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let entries = self.entries.entry_count();

        NamespaceStats {
            name: self.name.to_string(),
            entries,
            max_entries: self.max_entries,
            ttl_seconds: self.ttl.as_secs(),
            hits,
            misses,
            hit_rate: ratio(hits, hits + misses),
            stores: self.counters.stores.load(Ordering::Relaxed),
            fetch_failures: self.counters.fetch_failures.load(Ordering::Relaxed),
            utilization: ratio(entries, self.max_entries),
            approx_memory_bytes,
            oldest_entry_age_ms: oldest.map(|d| d.as_millis() as u64),
            newest_entry_age_ms: newest.map(|d| d.as_millis() as u64),
        }
    }

    pub fn reset_stats(&self) {
        for counter in [
            &self.counters.hits,
            &self.counters.misses,
            &self.counters.stores,
            &self.counters.fetch_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub total_entries: u64,
    pub approx_memory_bytes: u64,
    pub namespaces: Vec<NamespaceStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheHealth {
    pub status: HealthState,
    pub issues: Vec<String>,
    pub stats: CacheStats,
}

/// Outcome of [`CacheManager::preload`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreloadReport {
    pub requested: usize,
    pub loaded: usize,
    /// Already cached; no request issued.
    pub skipped: usize,
    pub failed: usize,
}

/// The process-wide set of cache namespaces.
#[derive(Clone)]
pub struct CacheManager {
    namespaces: Arc<HashMap<String, TtlCache<Value>>>,
    shutdown: CancellationToken,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CacheManager {
    pub fn new(config: &CacheConfig) -> Result<Self, AppError> {
        let mut namespaces = HashMap::new();
        for ns in &config.namespaces {
            if ns.ttl.is_zero() {
                return Err(AppError::ConfigError(format!(
                    "cache namespace '{}' needs a non-zero TTL",
                    ns.name
                )));
            }
            if ns.max_entries == 0 {
                return Err(AppError::ConfigError(format!(
                    "cache namespace '{}' needs max_entries > 0",
                    ns.name
                )));
            }
            let cache = TtlCache::new(&ns.name, ns.ttl, ns.max_entries);
            if namespaces.insert(ns.name.clone(), cache).is_some() {
                return Err(AppError::ConfigError(format!(
                    "cache namespace '{}' defined twice",
                    ns.name
                )));
            }
        }

        Ok(Self {
            namespaces: Arc::new(namespaces),
            shutdown: CancellationToken::new(),
            sweeper: Arc::new(Mutex::new(None)),
        })
    }

    /// Manager with the current, forecast, golf and historical namespaces.
    pub fn with_defaults() -> Result<Self, AppError> {
        Self::new(&CacheConfig::default())
    }

    pub fn namespace(&self, name: &str) -> Option<&TtlCache<Value>> {
        self.namespaces.get(name)
    }

    fn require(&self, name: &str) -> Result<&TtlCache<Value>, AppError> {
        self.namespace(name)
            .ok_or_else(|| AppError::ConfigError(format!("unknown cache namespace '{name}'")))
    }

    pub fn namespace_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.namespaces.keys().cloned().collect();
        names.sort();
        names
    }

    /// [`TtlCache::get_or_fetch`] on a named namespace.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        namespace: &str,
        key: &CacheKey,
        fetch: F,
    ) -> ApiResponse<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, AppError>>,
    {
        match self.require(namespace) {
            Ok(cache) => cache.get_or_fetch(key.as_str(), fetch).await,
            Err(e) => ApiResponse::new(Err(e), Uuid::new_v4()),
        }
    }

    /// Warm `namespace` with `keys`, sleeping `delay` between the requests
    /// actually issued so the upstream rate limit is respected.
    pub async fn preload<F, Fut>(
        &self,
        namespace: &str,
        keys: impl IntoIterator<Item = CacheKey>,
        delay: Duration,
        fetch: F,
    ) -> Result<PreloadReport, AppError>
    where
        F: Fn(CacheKey) -> Fut,
        Fut: Future<Output = Result<Value, AppError>>,
    {
        let cache = self.require(namespace)?;
        let mut report = PreloadReport::default();
        let mut issued_any = false;

        for key in keys {
            report.requested += 1;
            if cache.contains(key.as_str()) {
                report.skipped += 1;
                continue;
            }

            if issued_any && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            issued_any = true;

            let response = cache.get_or_fetch(key.as_str(), || fetch(key.clone())).await;
            match (&response.result, response.cached) {
                (Ok(_), false) => report.loaded += 1,
                (Ok(_), true) => report.skipped += 1,
                (Err(e), _) => {
                    tracing::debug!(namespace, key = %key, error = %e, "Preload fetch failed");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            namespace,
            requested = report.requested,
            loaded = report.loaded,
            skipped = report.skipped,
            failed = report.failed,
            "Cache preload finished"
        );
        Ok(report)
    }

    pub async fn stats(&self) -> CacheStats {
        let mut namespaces = Vec::with_capacity(self.namespaces.len());
        for name in self.namespace_names() {
            if let Some(cache) = self.namespaces.get(&name) {
                namespaces.push(cache.stats().await);
            }
        }

        let hits = namespaces.iter().map(|s| s.hits).sum();
        let misses = namespaces.iter().map(|s| s.misses).sum();
        CacheStats {
            hits,
            misses,
            hit_rate: ratio(hits, hits + misses),
            total_entries: namespaces.iter().map(|s| s.entries).sum(),
            approx_memory_bytes: namespaces.iter().map(|s| s.approx_memory_bytes).sum(),
            namespaces,
        }
    }

    /// Worst namespace health, with the reasons.
    pub async fn health(&self) -> CacheHealth {
        let stats = self.stats().await;
        let mut status = HealthState::Healthy;
        let mut issues = Vec::new();
        for ns in &stats.namespaces {
            let (ns_status, ns_issues) = ns.assess();
            status = status.max(ns_status);
            issues.extend(ns_issues);
        }
        CacheHealth {
            status,
            issues,
            stats,
        }
    }

    pub async fn clear_all(&self) {
        for cache in self.namespaces.values() {
            cache.clear().await;
        }
    }

    pub fn reset_stats(&self) {
        for cache in self.namespaces.values() {
            cache.reset_stats();
        }
    }

    pub async fn sweep(&self) {
        for cache in self.namespaces.values() {
            cache.sweep().await;
        }
    }

    /// Start the periodic expiry sweep. Calling it again is a no-op.
    pub fn spawn_sweeper(&self, interval: Duration) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|p| p.into_inner());
        if sweeper.is_some() {
            return;
        }

        let manager = self.clone();
        let shutdown = self.shutdown.clone();
        *sweeper = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => manager.sweep().await,
                    () = shutdown.cancelled() => break,
                }
            }
            tracing::debug!("Cache sweeper stopped");
        }));
    }

    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self.sweeper.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use serde_json::json;

    use super::*;
    use crate::config::NamespaceConfig;

    fn counting_fetch(
        calls: &AtomicU32,
        value: Value,
    ) -> impl Future<Output = Result<Value, AppError>> + '_ {
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        }
    }

    #[test]
    fn test_cache_key_quantizes_coordinates() {
        assert_eq!(
            CacheKey::current(40.71234, -74.00612).as_str(),
            "current:40.71,-74.01"
        );
        assert_eq!(
            CacheKey::current(40.714, -74.009),
            CacheKey::current(40.7149, -74.0051)
        );
        assert_ne!(CacheKey::current(40.71, -74.0), CacheKey::forecast(40.71, -74.0));
        assert_eq!(CacheKey::current(-0.001, 0.0).as_str(), "current:0.00,0.00");
    }

    #[test]
    fn test_cache_key_entity() {
        let key = CacheKey::golf(36.568, -121.95, "pebble-beach");
        assert_eq!(key.as_str(), "golf:36.57,-121.95:pebble-beach");
        assert_eq!(key.kind(), "golf");
    }

    #[tokio::test]
    async fn test_get_or_fetch_is_idempotent_within_ttl() {
        let cache = TtlCache::new("current", Duration::from_secs(600), 100);
        let calls = AtomicU32::new(0);
        let value = json!({"temp": 21.5, "wind": 3});

        let first = cache
            .get_or_fetch("k", || counting_fetch(&calls, value.clone()))
            .await;
        let second = cache
            .get_or_fetch("k", || counting_fetch(&calls, json!("other")))
            .await;

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.data(), second.data());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let entry = cache.get_entry("k").await.unwrap();
        assert_eq!(entry.hit_count(), 2);
        assert_eq!(entry.origin_request_id, first.request_id);
        assert!(entry.expires_at > entry.stored_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_fetch() {
        let cache = TtlCache::new("forecast", Duration::from_secs(3600), 100);
        let calls = AtomicU32::new(0);

        let fetch = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(json!([1, 2, 3]))
        };

        let (a, b) = tokio::join!(cache.get_or_fetch("k", fetch), cache.get_or_fetch("k", fetch));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.data(), b.data());
        // Exactly one of the two did the fetch.
        assert!(a.cached ^ b.cached);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache: TtlCache<Value> = TtlCache::new("golf", Duration::from_secs(60), 10);
        let calls = AtomicU32::new(0);

        let failed = cache
            .get_or_fetch("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::HttpStatus {
                    status: 503,
                    message: "overloaded".into(),
                })
            })
            .await;
        assert!(failed.retryable());
        assert!(!failed.cached);
        assert!(failed.error().unwrap().to_string().contains("503"));

        let recovered = cache
            .get_or_fetch("k", || counting_fetch(&calls, json!("ok")))
            .await;
        assert_eq!(recovered.data(), Some(&json!("ok")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().await.fetch_failures, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_stays_non_retryable() {
        let cache: TtlCache<Value> = TtlCache::new("golf", Duration::from_secs(60), 10);
        let resp = cache
            .get_or_fetch("k", || async {
                Err(AppError::HttpStatus {
                    status: 404,
                    message: "no such course".into(),
                })
            })
            .await;
        assert!(!resp.retryable());
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let cache = TtlCache::new("current", Duration::from_millis(100), 10);
        cache.insert("k", json!(1)).await;
        assert_eq!(cache.get("k").await, Some(json!(1)));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(cache.get("k").await, None);
        cache.sweep().await;
        assert_eq!(cache.entry_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let cache = TtlCache::new("current", Duration::from_secs(60), 10);
        cache.insert("a", json!(1)).await;
        cache.insert("b", json!(2)).await;

        cache.invalidate("a").await;
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, Some(json!(2)));

        cache.clear().await;
        assert_eq!(cache.entry_count().await, 0);
    }

    #[tokio::test]
    async fn test_stats_track_hits_and_misses() {
        let cache = TtlCache::new("current", Duration::from_secs(60), 4);
        cache.insert("a", json!(1)).await;
        cache.get("a").await;
        cache.get("a").await;
        cache.get("missing").await;

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.entries, 1);
        assert!((stats.utilization - 0.25).abs() < 1e-9);
        assert!(stats.approx_memory_bytes > 0);
        assert!(stats.oldest_entry_age_ms.is_some());

        cache.reset_stats();
        assert_eq!(cache.stats().await.hits, 0);
    }

    fn manager(max_entries: u64) -> CacheManager {
        CacheManager::new(&CacheConfig {
            namespaces: vec![NamespaceConfig::new(
                "current",
                Duration::from_secs(600),
                max_entries,
            )],
            sweep_interval: Duration::from_secs(60),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_manager_default_namespaces() {
        let manager = CacheManager::with_defaults().unwrap();
        assert_eq!(
            manager.namespace_names(),
            vec!["current", "forecast", "golf", "historical"]
        );
        assert_eq!(
            manager.namespace("golf").unwrap().ttl(),
            Duration::from_secs(6 * 60 * 60)
        );
    }

    #[test]
    fn test_manager_rejects_duplicate_namespace() {
        let ns = NamespaceConfig::new("current", Duration::from_secs(1), 1);
        let result = CacheManager::new(&CacheConfig {
            namespaces: vec![ns.clone(), ns],
            sweep_interval: Duration::from_secs(60),
        });
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_unknown_namespace_is_config_error() {
        let manager = manager(10);
        let resp = manager
            .get_or_fetch("tides", &CacheKey::current(0.0, 0.0), || async {
                Ok(json!(null))
            })
            .await;
        assert!(matches!(resp.error(), Some(AppError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_health_ignores_hit_rate_without_traffic() {
        let manager = manager(100);
        let health = manager.health().await;
        assert_eq!(health.status, HealthState::Healthy);
        assert!(health.issues.is_empty());
    }

    #[tokio::test]
    async fn test_health_low_hit_rate_is_unhealthy() {
        let manager = manager(1_000);
        let cache = manager.namespace("current").unwrap();
        for i in 0..MIN_LOOKUPS_FOR_HIT_RATE {
            cache.get(&format!("missing-{i}")).await;
        }
        let health = manager.health().await;
        assert_eq!(health.status, HealthState::Unhealthy);
        assert_eq!(health.issues.len(), 1);
    }

    #[tokio::test]
    async fn test_health_high_utilization_is_degraded() {
        let manager = manager(10);
        let cache = manager.namespace("current").unwrap();
        for i in 0..9 {
            cache.insert(&format!("k{i}"), json!(i)).await;
        }
        assert_eq!(manager.health().await.status, HealthState::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preload_paces_and_skips_cached_keys() {
        let manager = manager(100);
        let cache = manager.namespace("current").unwrap();
        cache.insert(CacheKey::current(1.0, 1.0).as_str(), json!("warm")).await;

        let keys = vec![
            CacheKey::current(1.0, 1.0),
            CacheKey::current(2.0, 2.0),
            CacheKey::current(3.0, 3.0),
            CacheKey::current(4.0, 4.0),
        ];
        let started = Instant::now();
        let report = manager
            .preload("current", keys, Duration::from_secs(1), |key| async move {
                if key.as_str().starts_with("current:4") {
                    Err(AppError::Timeout(10))
                } else {
                    Ok(json!(key.to_string()))
                }
            })
            .await
            .unwrap();

        assert_eq!(
            report,
            PreloadReport {
                requested: 4,
                loaded: 2,
                skipped: 1,
                failed: 1,
            }
        );
        // Three requests issued, two gaps between them.
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    // moka expires on the real clock, so this runs without a paused runtime.
    #[tokio::test]
    async fn test_sweeper_purges_expired_until_closed() {
        let manager = CacheManager::new(&CacheConfig {
            namespaces: vec![NamespaceConfig::new("current", Duration::from_millis(50), 10)],
            sweep_interval: Duration::from_millis(20),
        })
        .unwrap();
        let swept = manager.namespace("current").unwrap();
        let unswept = TtlCache::new("unswept", Duration::from_millis(50), 10);

        swept.insert("k", json!(1)).await;
        unswept.insert("k", json!(1)).await;
        assert_eq!(swept.entry_count().await, 1);
        assert_eq!(unswept.entry_count().await, 1);

        manager.spawn_sweeper(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(300)).await;
        // Read the raw counts so nothing here triggers housekeeping.
        assert_eq!(swept.entries.entry_count(), 0);
        assert_eq!(unswept.entries.entry_count(), 1);

        tokio::time::timeout(Duration::from_secs(1), manager.close())
            .await
            .expect("sweeper did not stop");
        assert!(manager.sweeper.lock().unwrap().is_none());

        swept.insert("k", json!(2)).await;
        assert_eq!(swept.entry_count().await, 1);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(swept.entries.entry_count(), 1);
    }
}
