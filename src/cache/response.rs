//! In-memory response cache with per-class TTLs
//!
//! Entries expire lazily: nothing sweeps the map, a read past the deadline
//! deletes the entry and reports a miss. Expiry is computed from wall-clock
//! creation time plus TTL so persisted entries age correctly across
//! restarts.
//!
//! There is deliberately no request coalescing here: two concurrent misses
//! on the same fingerprint both hit upstream. Client request patterns are
//! bursty per user, and per-user fingerprints keep the duplication bounded.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::persist::{CachePersistence, PersistedEntry};
use crate::types::Result;

/// Resource classes with independent TTLs.
///
/// Library structure barely moves, now-playing state moves every few
/// seconds; one TTL cannot serve both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
    /// Library sections and their listings
    Library,
    /// Individual item metadata
    Metadata,
    /// Live playback state
    NowPlaying,
    /// Search results
    Search,
    /// Anything unclassified
    Default,
}

/// Per-class TTLs in seconds.
#[derive(Debug, Clone)]
pub struct CacheTtlConfig {
    pub library_secs: u64,
    pub metadata_secs: u64,
    pub now_playing_secs: u64,
    pub search_secs: u64,
    pub default_secs: u64,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            library_secs: 43200,
            metadata_secs: 86400,
            now_playing_secs: 10,
            search_secs: 300,
            default_secs: 60,
        }
    }
}

impl CacheTtlConfig {
    pub fn ttl_seconds(&self, class: ResourceClass) -> u64 {
        match class {
            ResourceClass::Library => self.library_secs,
            ResourceClass::Metadata => self.metadata_secs,
            ResourceClass::NowPlaying => self.now_playing_secs,
            ResourceClass::Search => self.search_secs,
            ResourceClass::Default => self.default_secs,
        }
    }
}

/// One cached upstream response, as relayed to clients.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

/// Map entry: the response plus its expiry inputs.
#[derive(Debug, Clone)]
struct CacheEntry {
    response: CachedResponse,
    created_at: DateTime<Utc>,
    ttl_seconds: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.created_at + Duration::seconds(self.ttl_seconds as i64)
    }
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub invalidations: u64,
    pub expirations: u64,
    pub hit_rate: f64,
}

/// Fingerprint-keyed response cache.
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    ttls: CacheTtlConfig,
    persist: Option<Arc<CachePersistence>>,

    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    invalidations: AtomicU64,
    expirations: AtomicU64,
}

impl ResponseCache {
    /// Cache without disk persistence. Used in tests and when the data
    /// directory is unavailable.
    pub fn memory_only(ttls: CacheTtlConfig) -> Self {
        Self::build(ttls, None)
    }

    /// Cache backed by a persistence directory.
    pub fn with_persistence(ttls: CacheTtlConfig, persist: CachePersistence) -> Self {
        Self::build(ttls, Some(Arc::new(persist)))
    }

    fn build(ttls: CacheTtlConfig, persist: Option<Arc<CachePersistence>>) -> Self {
        Self {
            entries: DashMap::new(),
            ttls,
            persist,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Look up a fingerprint. Expired entries are removed on the spot and
    /// count as misses.
    pub fn get(&self, fingerprint: &str) -> Option<CachedResponse> {
        let now = Utc::now();

        if let Some(entry) = self.entries.get(fingerprint) {
            if !entry.is_expired(now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.response.clone());
            }
            // Expired: drop the guard before removing
            drop(entry);
            self.entries.remove(fingerprint);
            self.remove_persisted(fingerprint);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            debug!(fingerprint = fingerprint, "Cache entry expired");
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a response under a fingerprint.
    pub fn set(&self, fingerprint: &str, response: CachedResponse, class: ResourceClass) {
        let entry = CacheEntry {
            response,
            created_at: Utc::now(),
            ttl_seconds: self.ttls.ttl_seconds(class),
        };

        self.spawn_persist(fingerprint, &entry);
        self.entries.insert(fingerprint.to_string(), entry);
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop a single fingerprint. Returns whether an entry existed.
    pub fn invalidate(&self, fingerprint: &str) -> bool {
        let existed = self.entries.remove(fingerprint).is_some();
        self.remove_persisted(fingerprint);
        if existed {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        existed
    }

    /// Drop every fingerprint starting with `prefix`. Returns how many went.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();

        for key in &keys {
            self.entries.remove(key);
            self.remove_persisted(key);
        }

        self.invalidations
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        keys.len()
    }

    /// Serve from cache or run `fetch` and remember the result.
    ///
    /// Only 2xx responses are stored. Errors and upstream failure statuses
    /// pass through uncached so one bad moment upstream cannot get pinned
    /// for a TTL.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        fingerprint: &str,
        class: ResourceClass,
        fetch: F,
    ) -> Result<CachedResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedResponse>>,
    {
        if let Some(cached) = self.get(fingerprint) {
            return Ok(cached);
        }

        let response = fetch().await?;

        if (200..300).contains(&response.status) {
            self.set(fingerprint, response.clone(), class);
        } else {
            debug!(
                fingerprint = fingerprint,
                status = response.status,
                "Not caching non-success upstream response"
            );
        }

        Ok(response)
    }

    /// Load persisted entries from disk, discarding expired ones.
    ///
    /// Called once at startup, before the listener opens.
    pub async fn rehydrate(&self) -> usize {
        let Some(persist) = &self.persist else {
            return 0;
        };

        let records = persist.load_all().await;
        let count = records.len();

        for record in records {
            self.entries.insert(
                record.fingerprint.clone(),
                CacheEntry {
                    response: CachedResponse {
                        status: record.status,
                        content_type: record.content_type,
                        body: record.body,
                    },
                    created_at: record.created_at,
                    ttl_seconds: record.ttl_seconds,
                },
            );
        }

        if count > 0 {
            info!(entries = count, "Rehydrated response cache from disk");
        }
        count
    }

    /// Whether entries are also written to disk.
    pub fn persistent(&self) -> bool {
        self.persist.is_some()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            entries: self.entries.len(),
            hits,
            misses,
            inserts: self.inserts.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    fn spawn_persist(&self, fingerprint: &str, entry: &CacheEntry) {
        if let Some(persist) = &self.persist {
            let persist = Arc::clone(persist);
            let record = PersistedEntry {
                fingerprint: fingerprint.to_string(),
                status: entry.response.status,
                content_type: entry.response.content_type.clone(),
                body: entry.response.body.clone(),
                created_at: entry.created_at,
                ttl_seconds: entry.ttl_seconds,
            };
            tokio::spawn(async move {
                if let Err(e) = persist.store(&record).await {
                    warn!(error = %e, "Failed to persist cache entry");
                }
            });
        }
    }

    fn remove_persisted(&self, fingerprint: &str) {
        if let Some(persist) = &self.persist {
            let persist = Arc::clone(persist);
            let fingerprint = fingerprint.to_string();
            tokio::spawn(async move {
                persist.remove(&fingerprint).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UsherError;
    use std::sync::atomic::AtomicUsize;

    fn response(body: &str) -> CachedResponse {
        CachedResponse {
            status: 200,
            content_type: "application/json".to_string(),
            body: Bytes::from(body.to_string()),
        }
    }

    fn cache() -> ResponseCache {
        ResponseCache::memory_only(CacheTtlConfig::default())
    }

    #[test]
    fn test_set_then_get() {
        let cache = cache();
        cache.set("user:u1|server:s1|/library/sections", response("libs"), ResourceClass::Library);

        let hit = cache.get("user:u1|server:s1|/library/sections").unwrap();
        assert_eq!(hit.status, 200);
        assert_eq!(hit.body, Bytes::from("libs"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_miss_on_absent_fingerprint() {
        let cache = cache();
        assert!(cache.get("user:u1|server:s1|/nothing").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_zero_ttl_expires_immediately() {
        let ttls = CacheTtlConfig {
            now_playing_secs: 0,
            ..Default::default()
        };
        let cache = ResponseCache::memory_only(ttls);
        cache.set("fp", response("live"), ResourceClass::NowPlaying);

        assert!(cache.get("fp").is_none());
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn test_users_do_not_share_entries() {
        let cache = cache();
        cache.set("user:u1|server:s1|/library/sections", response("alice"), ResourceClass::Library);
        cache.set("user:u2|server:s1|/library/sections", response("bob"), ResourceClass::Library);

        assert_eq!(
            cache.get("user:u1|server:s1|/library/sections").unwrap().body,
            Bytes::from("alice")
        );
        assert_eq!(
            cache.get("user:u2|server:s1|/library/sections").unwrap().body,
            Bytes::from("bob")
        );
    }

    #[test]
    fn test_invalidate_single() {
        let cache = cache();
        cache.set("fp", response("x"), ResourceClass::Metadata);
        assert!(cache.invalidate("fp"));
        assert!(cache.get("fp").is_none());
        assert!(!cache.invalidate("fp"));
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_invalidate_prefix() {
        let cache = cache();
        cache.set("user:u1|server:s1|/library/items/1", response("a"), ResourceClass::Metadata);
        cache.set("user:u1|server:s1|/library/items/2", response("b"), ResourceClass::Metadata);
        cache.set("user:u2|server:s1|/library/items/1", response("c"), ResourceClass::Metadata);

        let removed = cache.invalidate_prefix("user:u1|server:s1|");
        assert_eq!(removed, 2);
        assert!(cache.get("user:u1|server:s1|/library/items/1").is_none());
        assert!(cache.get("user:u2|server:s1|/library/items/1").is_some());
    }

    #[tokio::test]
    async fn test_get_or_fetch_calls_upstream_once() {
        let cache = cache();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let result = cache
                .get_or_fetch("fp", ResourceClass::Library, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(response("fetched"))
                })
                .await
                .unwrap();
            assert_eq!(result.body, Bytes::from("fetched"));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_fetch_does_not_cache_errors() {
        let cache = cache();
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_fetch("fp", ResourceClass::Library, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<CachedResponse, _>(UsherError::Upstream("connection refused".to_string()))
            })
            .await;
        assert!(first.is_err());

        // The failure was not cached; the next call fetches again
        let second = cache
            .get_or_fetch("fp", ResourceClass::Library, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(response("recovered"))
            })
            .await
            .unwrap();
        assert_eq!(second.body, Bytes::from("recovered"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_get_or_fetch_does_not_cache_upstream_error_statuses() {
        let cache = cache();
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let result = cache
                .get_or_fetch("fp", ResourceClass::Default, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(CachedResponse {
                        status: 404,
                        content_type: "application/json".to_string(),
                        body: Bytes::from_static(b"{\"error\":\"not found\"}"),
                    })
                })
                .await
                .unwrap();
            assert_eq!(result.status, 404);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stats_hit_rate() {
        let cache = cache();
        cache.set("fp", response("x"), ResourceClass::Library);
        cache.get("fp");
        cache.get("fp");
        cache.get("absent");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_class_ttls_are_independent() {
        let ttls = CacheTtlConfig {
            library_secs: 3600,
            now_playing_secs: 0,
            ..Default::default()
        };
        let cache = ResponseCache::memory_only(ttls);
        cache.set("lib", response("durable"), ResourceClass::Library);
        cache.set("now", response("gone"), ResourceClass::NowPlaying);

        assert!(cache.get("lib").is_some());
        assert!(cache.get("now").is_none());
    }
}
