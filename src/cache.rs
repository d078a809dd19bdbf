//! Short-TTL caching of upstream responses with stale-on-error fallback
//!
//! Provides a thread-safe, TTL-based cache for expensive provider calls
//! (guild lists, bot-presence probes). A stale entry is served only when a
//! live fetch fails; staleness never substitutes for authentication.

use std::future::Future;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

use crate::Result;

/// A cached value carrying its capture time, so callers can enforce
/// freshness independent of the backing store's expiry granularity
#[derive(Debug, Clone)]
struct CachedValue<T> {
    data: T,
    cached_at: Instant,
}

impl<T> CachedValue<T> {
    fn age(&self) -> Duration {
        Instant::now().duration_since(self.cached_at)
    }
}

/// Result of a cache lookup: the data plus whether it was served past its
/// freshness window as an availability fallback
#[derive(Debug, Clone)]
pub struct FetchOutcome<T> {
    /// The cached or freshly fetched value
    pub data: T,
    /// True when the value is older than the TTL and was served because the
    /// live fetch failed
    pub served_stale: bool,
}

/// TTL cache that falls back to stale entries when the fetch fails
pub struct StaleCache<T: Clone> {
    entries: DashMap<String, CachedValue<T>>,
    ttl: Duration,
}

impl<T: Clone> StaleCache<T> {
    /// Create a cache with the given freshness window
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Return a fresh cached value, or fetch on miss.
    ///
    /// On fetch failure (including a rate-limited upstream) a stale entry is
    /// returned with `served_stale = true` and a warning logged. With no
    /// entry at all, the fetch error propagates.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<FetchOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // Clone out of the map so no shard lock is held across the fetch await
        let cached = self.entries.get(key).map(|entry| entry.value().clone());

        if let Some(ref entry) = cached {
            if entry.age() <= self.ttl {
                return Ok(FetchOutcome {
                    data: entry.data.clone(),
                    served_stale: false,
                });
            }
        }

        match fetch().await {
            Ok(data) => {
                self.entries.insert(
                    key.to_string(),
                    CachedValue {
                        data: data.clone(),
                        cached_at: Instant::now(),
                    },
                );
                Ok(FetchOutcome {
                    data,
                    served_stale: false,
                })
            }
            Err(e) => {
                if let Some(entry) = cached {
                    warn!(key = %key, error = %e, age_secs = entry.age().as_secs(),
                        "Upstream fetch failed, serving stale cache entry");
                    Ok(FetchOutcome {
                        data: entry.data,
                        served_stale: true,
                    })
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Drop a cached entry
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Number of entries currently held (fresh and stale)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[tokio::test]
    async fn miss_fetches_and_stores() {
        let cache: StaleCache<u32> = StaleCache::new(Duration::from_secs(60));
        let outcome = cache
            .get_or_fetch("k", || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(outcome.data, 7);
        assert!(!outcome.served_stale);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn fresh_hit_skips_fetch() {
        let cache: StaleCache<u32> = StaleCache::new(Duration::from_secs(60));
        cache.get_or_fetch("k", || async { Ok(1) }).await.unwrap();

        // The second fetch closure must never run
        let outcome = cache
            .get_or_fetch("k", || async {
                panic!("fetch ran on a fresh hit");
                #[allow(unreachable_code)]
                Ok(0)
            })
            .await
            .unwrap();
        assert_eq!(outcome.data, 1);
        assert!(!outcome.served_stale);
    }

    #[tokio::test]
    async fn expired_entry_is_refetched() {
        let cache: StaleCache<u32> = StaleCache::new(Duration::from_millis(1));
        cache.get_or_fetch("k", || async { Ok(1) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let outcome = cache.get_or_fetch("k", || async { Ok(2) }).await.unwrap();
        assert_eq!(outcome.data, 2);
        assert!(!outcome.served_stale);
    }

    #[tokio::test]
    async fn stale_entry_served_when_fetch_fails() {
        let cache: StaleCache<u32> = StaleCache::new(Duration::from_millis(1));
        cache.get_or_fetch("k", || async { Ok(42) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let outcome = cache
            .get_or_fetch("k", || async { Err(Error::upstream(429, "rate limited")) })
            .await
            .unwrap();
        assert_eq!(outcome.data, 42);
        assert!(outcome.served_stale);
    }

    #[tokio::test]
    async fn error_propagates_without_cached_entry() {
        let cache: StaleCache<u32> = StaleCache::new(Duration::from_secs(60));
        let err = cache
            .get_or_fetch("k", || async { Err(Error::upstream(503, "down")) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upstream { status: 503, .. }));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let cache: StaleCache<u32> = StaleCache::new(Duration::from_secs(60));
        cache.get_or_fetch("a", || async { Ok(1) }).await.unwrap();
        cache.get_or_fetch("b", || async { Ok(2) }).await.unwrap();

        let a = cache
            .get_or_fetch("a", || async { Err(Error::Internal("no".into())) })
            .await
            .unwrap();
        assert_eq!(a.data, 1);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let cache: StaleCache<u32> = StaleCache::new(Duration::from_secs(60));
        cache.get_or_fetch("k", || async { Ok(1) }).await.unwrap();
        cache.invalidate("k");
        let outcome = cache.get_or_fetch("k", || async { Ok(2) }).await.unwrap();
        assert_eq!(outcome.data, 2);
    }
}
