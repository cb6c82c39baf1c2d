//! An in-memory cache without eviction.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use super::CacheJson;
use crate::fetcher::{StoredJson, StoredMap};

/// Keeps every saved entry until it's invalidated.
///
/// Memory grows with the number of distinct IDs saved, only use it when the stored
/// dataset is known to be small.
#[derive(Debug, Default)]
pub struct UnboundedCache {
    entries: RwLock<StoredMap>,
}

impl UnboundedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A panic while holding the lock can only happen between two complete map
    // operations, the map is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, StoredMap> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoredMap> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CacheJson for UnboundedCache {
    async fn get(&self, ids: &[String]) -> StoredMap {
        let entries = self.read();
        ids.iter()
            .filter_map(|id| entries.get(id).map(|json| (id.clone(), StoredJson::clone(json))))
            .collect()
    }

    async fn save(&self, data: &StoredMap) {
        if data.is_empty() {
            return;
        }
        let mut entries = self.write();
        for (id, json) in data {
            entries.insert(id.clone(), json.clone());
        }
    }

    async fn invalidate(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let mut entries = self.write();
        for id in ids {
            entries.remove(id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cache::tests::{assert_round_trip, blobs, ids};

    #[stored_requests_macros::tokio_test]
    async fn test_unbounded_round_trip() {
        let cache = UnboundedCache::new();
        assert_round_trip(&cache).await;
        assert_eq!(cache.len(), 1);
    }

    #[stored_requests_macros::tokio_test]
    async fn test_unbounded_concurrent_writers() {
        let cache = Arc::new(UnboundedCache::new());
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    let id = format!("id-{i}");
                    cache.save(&blobs(&[(id.as_str(), "1")])).await;
                    if i % 2 == 0 {
                        cache.invalidate(&[id]).await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(cache.len(), 8);
        assert_eq!(cache.get(&ids(&["id-1", "id-2"])).await.len(), 1);
    }
}
