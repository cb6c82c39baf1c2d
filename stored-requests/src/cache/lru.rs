//! Bounded in-memory cache with weight-based eviction.
//!
//! Entries are weighted by the byte length of their ID plus their JSON text, so the
//! configured size is roughly the memory held by the cached documents.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use quick_cache::{Weighter, sync::Cache};

use super::CacheJson;
use crate::fetcher::{StoredJson, StoredMap};

// Rough guess of the average entry size, only used to preallocate.
const ESTIMATED_ENTRY_BYTES: u64 = 512;

#[derive(Debug, Clone)]
struct Entry {
    json: StoredJson,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

#[derive(Debug, Clone)]
struct JsonWeighter;

impl Weighter<String, Entry> for JsonWeighter {
    fn weight(&self, key: &String, value: &Entry) -> u64 {
        (key.len() + value.json.len()) as u64
    }
}

/// An in-memory cache bounded by total size in bytes.
///
/// Eviction follows the `quick_cache` policy, which approximates LRU: the entries
/// evicted when the cache is full are not guaranteed to be exactly the least recently
/// used ones, only the size bound is.
///
/// When `ttl` is set, entries older than `ttl` are never returned and are removed on
/// the next lookup that finds them.
#[derive(Debug)]
pub struct LruCache {
    cache: Cache<String, Entry, JsonWeighter>,
    capacity: u64,
    ttl: Option<Duration>,
}

impl LruCache {
    pub fn new(capacity_bytes: u64, ttl: Option<Duration>) -> Self {
        let estimated_items = (capacity_bytes / ESTIMATED_ENTRY_BYTES).max(16);
        Self {
            cache: Cache::with_weighter(
                estimated_items.try_into().unwrap_or(usize::MAX),
                capacity_bytes,
                JsonWeighter,
            ),
            capacity: capacity_bytes,
            ttl,
        }
    }

    /// Total weight, in bytes, of the entries currently held.
    pub fn weight(&self) -> u64 {
        self.cache.weight()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Removes `id` only if its entry is still expired at `now`, so a save racing with
    /// the lookup is kept.
    fn remove_expired(&self, id: &str, now: Instant) -> bool {
        self.cache.remove_if(id, |entry| entry.is_expired(now)).is_some()
    }
}

#[async_trait]
impl CacheJson for LruCache {
    async fn get(&self, ids: &[String]) -> StoredMap {
        let now = Instant::now();
        let mut found = StoredMap::with_capacity(ids.len());
        for id in ids {
            match self.cache.get(id) {
                Some(entry) if entry.is_expired(now) => {
                    self.remove_expired(id, now);
                }
                Some(entry) => {
                    found.insert(id.clone(), entry.json);
                }
                None => {}
            }
        }
        found
    }

    async fn save(&self, data: &StoredMap) {
        let expires_at = self.ttl.map(|ttl| Instant::now() + ttl);
        for (id, json) in data {
            let entry = Entry { json: json.clone(), expires_at };
            let weight = JsonWeighter.weight(id, &entry);
            if weight > self.capacity {
                tracing::warn!(
                    id = id.as_str(),
                    weight,
                    capacity = self.capacity,
                    "Stored data entry too large for the cache, it won't be cached"
                );
                // drop any older value so it's not served stale
                self.cache.remove(id);
                continue;
            }
            self.cache.insert(id.clone(), entry);
        }
    }

    async fn invalidate(&self, ids: &[String]) {
        for id in ids {
            self.cache.remove(id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cache::tests::{assert_round_trip, blobs, ids};

    #[stored_requests_macros::tokio_test]
    async fn test_lru_round_trip() {
        let cache = LruCache::new(1 << 20, None);
        assert_round_trip(&cache).await;
    }

    #[stored_requests_macros::tokio_test]
    async fn test_lru_respects_size_bound() {
        let capacity = 4 * 1024;
        let cache = LruCache::new(capacity, None);
        let value = format!(r#""{}""#, "x".repeat(100));
        for i in 0..200 {
            let id = format!("id-{i:03}");
            cache.save(&blobs(&[(id.as_str(), value.as_str())])).await;
        }
        assert!(cache.weight() <= capacity);
        assert!(cache.len() < 200);
        assert!(!cache.is_empty());
    }

    #[stored_requests_macros::tokio_test]
    async fn test_lru_rejects_oversized_entry() {
        let cache = LruCache::new(64, None);
        cache.save(&blobs(&[("small", "1")])).await;
        let big = format!(r#""{}""#, "y".repeat(128));
        cache.save(&blobs(&[("small", big.as_str())])).await;
        assert_eq!(cache.get(&ids(&["small"])).await, StoredMap::new());
    }

    #[stored_requests_macros::tokio_test]
    async fn test_lru_expires_entries() {
        let cache = LruCache::new(1 << 20, Some(Duration::from_millis(20)));
        cache.save(&blobs(&[("a", "{}")])).await;
        assert_eq!(cache.get(&ids(&["a"])).await.len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get(&ids(&["a"])).await, StoredMap::new());
        assert!(cache.is_empty());

        // saving again restarts the clock
        cache.save(&blobs(&[("a", "{}")])).await;
        assert_eq!(cache.get(&ids(&["a"])).await.len(), 1);
    }

    #[stored_requests_macros::tokio_test]
    async fn test_expiry_keeps_entry_saved_after_the_lookup() {
        let cache = LruCache::new(1 << 20, Some(Duration::from_millis(20)));
        cache.save(&blobs(&[("a", "1")])).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the lookup saw the stale entry, then a save landed before the removal
        let looked_up_at = Instant::now();
        cache.save(&blobs(&[("a", "2")])).await;
        assert!(!cache.remove_expired("a", looked_up_at));
        assert_eq!(cache.get(&ids(&["a"])).await, blobs(&[("a", "2")]));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.remove_expired("a", Instant::now()));
        assert!(cache.is_empty());
    }
}
