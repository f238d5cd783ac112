//! TTL-bounded lookup caches for expensive external calls.
//!
//! Two instances are kept: resolved coordinates (long TTL) and route ETAs
//! (short TTL). Both are plain [`TtlCache`]s over an `lru::LruCache` used in
//! insertion order: reads go through `peek` so they never refresh an entry,
//! which makes the LRU end the oldest insertion.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use h3o::CellIndex;
use lru::LruCache;
use tokio::time::Instant;

use crate::config::CacheConfig;
use crate::request::Coordinate;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// Size-bounded cache whose entries expire a fixed time after insertion.
///
/// An entry older than the TTL is never returned. When an insert would exceed
/// the maximum size, the oldest entry by insertion time is evicted. A poisoned
/// lock degrades to a miss on read and a dropped write, never a panic.
pub struct TtlCache<K: Hash + Eq, V> {
    ttl: Duration,
    entries: Mutex<LruCache<K, Entry<V>>>,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().ok()?;
        let fresh = match entries.peek(key) {
            Some(entry) => entry.inserted_at.elapsed() < self.ttl,
            None => return None,
        };
        if fresh {
            entries.peek(key).map(|entry| entry.value.clone())
        } else {
            entries.pop(key);
            None
        }
    }

    /// Insert or replace `key`. Replacing counts as a fresh insertion.
    pub fn put(&self, key: K, value: V) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        entries.push(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let mut removed = 0;
        // Insertion order: stop at the first entry still within its TTL.
        while let Some((_, entry)) = entries.peek_lru() {
            if entry.inserted_at.elapsed() < self.ttl {
                break;
            }
            entries.pop_lru();
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Directed route leg between two route-resolution H3 cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteKey {
    pub from: CellIndex,
    pub to: CellIndex,
}

impl RouteKey {
    pub fn new(from: CellIndex, to: CellIndex) -> Self {
        Self { from, to }
    }

    pub fn is_trivial(&self) -> bool {
        self.from == self.to
    }
}

/// The two caches shared by every run of one process.
///
/// Created empty and owned explicitly by whoever builds the scheduler; the
/// only reset is TTL expiry.
pub struct LookupCaches {
    pub coordinates: TtlCache<String, Coordinate>,
    pub routes: TtlCache<RouteKey, Duration>,
}

impl LookupCaches {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            coordinates: TtlCache::new(
                Duration::from_secs(config.coordinate_ttl_secs),
                config.coordinate_max_entries,
            ),
            routes: TtlCache::new(
                Duration::from_secs(config.route_ttl_secs),
                config.route_max_entries,
            ),
        }
    }
}

impl Default for LookupCaches {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn put_then_get_until_ttl_elapses() {
        let cache = TtlCache::new(Duration::from_secs(60), 8);
        cache.put("lax".to_string(), 1u32);
        assert_eq!(cache.get(&"lax".to_string()), Some(1));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get(&"lax".to_string()), Some(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get(&"lax".to_string()), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reads_do_not_refresh_expiry() {
        let cache = TtlCache::new(Duration::from_secs(10), 8);
        cache.put(1u8, "a");
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(3)).await;
            assert_eq!(cache.get(&1), Some("a"));
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get(&1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_oldest_insertion_first() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.put(1u8, 'a');
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.put(2u8, 'b');
        // Reading the oldest entry must not save it from eviction.
        assert_eq!(cache.get(&1), Some('a'));
        cache.put(3u8, 'c');

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some('b'));
        assert_eq!(cache.get(&3), Some('c'));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_only_expired_prefix() {
        let cache = TtlCache::new(Duration::from_secs(10), 8);
        cache.put(1u8, 1u8);
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.put(2u8, 2u8);
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.get(&2), Some(2));
    }

    #[tokio::test]
    async fn concurrent_writers_leave_one_complete_value() {
        let cache = Arc::new(TtlCache::new(Duration::from_secs(60), 16));
        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.put("eta", (i, i * 2)) })
            })
            .collect();
        for handle in handles {
            handle.await.expect("writer task");
        }
        let (a, b) = cache.get(&"eta").expect("value present");
        assert_eq!(b, a * 2);
        assert_eq!(cache.len(), 1);
    }
}
