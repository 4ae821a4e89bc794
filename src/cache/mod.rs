//! The memory store (C3): a bounded, admission-policy cache keyed by flag key.
//!
//! Grounded on the teacher crate's `cache::service::CacheService` /
//! `cache::lru::LruCacheImpl` pair — an LRU cache wrapped with a TTL check
//! and read/write counters, but here keyed directly by flag key (one entry
//! per flag, not per flag+context) since the design's cache holds flag
//! snapshots, not evaluation results.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::RwLock;
use tracing::debug;

use crate::model::Flag;

#[derive(Debug)]
struct Entry {
    flag: Flag,
    inserted_at: Instant,
}

/// Counters exposed by [`MemoryStore::metrics`]. Serializable so an admin
/// surface (C10) can report it verbatim.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheMetrics {
    pub keys_added: u64,
    pub keys_updated: u64,
    pub keys_evicted: u64,
    pub sets_rejected: u64,
    pub gets_kept: u64,
    pub gets_dropped: u64,
}

impl CacheMetrics {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.gets_kept + self.gets_dropped;
        if total == 0 {
            0.0
        } else {
            self.gets_kept as f64 / total as f64
        }
    }
}

struct Inner {
    cache: LruCache<String, Entry>,
    ttl: Option<Duration>,
    metrics: CacheMetrics,
}

/// Bounded cache keyed by flag key. `get` never blocks on I/O; `set` may be
/// silently rejected by the admission policy, which is not an error.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new(max_size: usize, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).expect("max_size clamped to >= 1");
        Self {
            inner: RwLock::new(Inner {
                cache: LruCache::new(capacity),
                ttl,
                metrics: CacheMetrics::default(),
            }),
        }
    }

    /// Returns the cached flag if present and not expired.
    pub async fn get(&self, key: &str) -> Option<Flag> {
        let mut inner = self.inner.write().await;
        let ttl = inner.ttl;
        let expired = match inner.cache.peek(key) {
            Some(entry) => ttl.is_some_and(|ttl| entry.inserted_at.elapsed() > ttl),
            None => {
                inner.metrics.gets_dropped += 1;
                return None;
            }
        };
        if expired {
            inner.cache.pop(key);
            inner.metrics.gets_dropped += 1;
            return None;
        }
        inner.metrics.gets_kept += 1;
        inner.cache.get(key).map(|entry| entry.flag.clone())
    }

    /// Inserts or replaces the flag snapshot for `key`. Never an error: a
    /// zero-capacity store would reject every set, counted in
    /// `sets_rejected`, but capacity is clamped to at least 1 at construction
    /// so in practice every set is admitted and eviction is left to the LRU
    /// policy.
    pub async fn set(&self, key: impl Into<String>, flag: Flag) {
        let key = key.into();
        let mut inner = self.inner.write().await;
        let existed = inner.cache.contains(&key);
        let evicted = inner.cache.push(
            key,
            Entry {
                flag,
                inserted_at: Instant::now(),
            },
        );
        if existed {
            inner.metrics.keys_updated += 1;
        } else {
            inner.metrics.keys_added += 1;
        }
        if let Some((evicted_key, _)) = evicted {
            debug!(key = %evicted_key, "memory store evicted flag at capacity");
            inner.metrics.keys_evicted += 1;
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.write().await;
        inner.cache.pop(key).is_some()
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.cache.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.cache.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn metrics(&self) -> CacheMetrics {
        self.inner.read().await.metrics.clone()
    }

    /// Snapshots every currently-cached flag, keyed by flag key. Listing is
    /// not part of the store's read-path contract (the design notes say
    /// enumeration is not guaranteed by the underlying cache); this walks a
    /// consistent locked view for callers, like `InvalidateAll`, that
    /// genuinely need it.
    pub async fn snapshot_all(&self) -> std::collections::HashMap<String, Flag> {
        let inner = self.inner.read().await;
        inner
            .cache
            .iter()
            .map(|(k, v)| (k.clone(), v.flag.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Flag;
    use std::collections::HashMap;

    fn flag(key: &str) -> Flag {
        Flag {
            id: 1,
            key: key.to_string(),
            enabled: true,
            variants: vec![],
            segments: vec![],
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn get_after_delete_is_a_miss() {
        let store = MemoryStore::new(10, None);
        store.set("a", flag("a")).await;
        assert!(store.get("a").await.is_some());
        assert!(store.delete("a").await);
        assert!(store.get("a").await.is_none());
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let store = MemoryStore::new(2, None);
        store.set("a", flag("a")).await;
        store.set("b", flag("b")).await;
        store.get("a").await; // touch a, making b the LRU entry
        store.set("c", flag("c")).await;

        assert!(store.get("a").await.is_some());
        assert!(store.get("b").await.is_none());
        assert!(store.get("c").await.is_some());
        assert_eq!(store.metrics().await.keys_evicted, 1);
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let store = MemoryStore::new(10, Some(Duration::from_millis(10)));
        store.set("a", flag("a")).await;
        assert!(store.get("a").await.is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("a").await.is_none());
    }

    #[tokio::test]
    async fn set_twice_counts_as_update_not_add() {
        let store = MemoryStore::new(10, None);
        store.set("a", flag("a")).await;
        store.set("a", flag("a")).await;
        let metrics = store.metrics().await;
        assert_eq!(metrics.keys_added, 1);
        assert_eq!(metrics.keys_updated, 1);
    }

    #[tokio::test]
    async fn snapshot_all_reflects_current_entries() {
        let store = MemoryStore::new(10, None);
        store.set("a", flag("a")).await;
        store.set("b", flag("b")).await;
        let snapshot: HashMap<_, _> = store.snapshot_all().await;
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains_key("a"));
    }
}
