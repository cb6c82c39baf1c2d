//! Layering of several caches.

use std::sync::Arc;

use async_trait::async_trait;

use super::CacheJson;
use crate::fetcher::StoredMap;

/// Tries each inner cache in order, asking later layers only for the IDs the earlier
/// ones didn't have.
///
/// Entries found in a later layer are not copied into the earlier ones. Writes and
/// invalidations go to every layer.
#[derive(Debug, Clone, Default)]
pub struct ComposedCache {
    layers: Vec<Arc<dyn CacheJson>>,
}

impl ComposedCache {
    pub fn new(layers: Vec<Arc<dyn CacheJson>>) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> &[Arc<dyn CacheJson>] {
        &self.layers
    }
}

#[async_trait]
impl CacheJson for ComposedCache {
    async fn get(&self, ids: &[String]) -> StoredMap {
        let mut found = StoredMap::with_capacity(ids.len());
        let mut remaining: Vec<String> = ids.to_vec();
        for layer in &self.layers {
            if remaining.is_empty() {
                break;
            }
            let hits = layer.get(&remaining).await;
            if hits.is_empty() {
                continue;
            }
            remaining.retain(|id| !hits.contains_key(id));
            found.extend(hits);
        }
        found
    }

    async fn save(&self, data: &StoredMap) {
        for layer in &self.layers {
            layer.save(data).await;
        }
    }

    async fn invalidate(&self, ids: &[String]) {
        for layer in &self.layers {
            layer.invalidate(ids).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cache::{
        NoOpCache, UnboundedCache,
        tests::{assert_round_trip, blobs, ids},
    };

    #[stored_requests_macros::tokio_test]
    async fn test_composed_round_trip() {
        let layers: Vec<Arc<dyn CacheJson>> = vec![
            Arc::new(NoOpCache),
            Arc::new(UnboundedCache::new()),
            Arc::new(UnboundedCache::new()),
        ];
        let cache = ComposedCache::new(layers);
        assert_round_trip(&cache).await;
    }

    #[stored_requests_macros::tokio_test]
    async fn test_earlier_layer_wins_and_no_backfill() {
        let first = Arc::new(UnboundedCache::new());
        let second = Arc::new(UnboundedCache::new());
        first.save(&blobs(&[("a", "1")])).await;
        second.save(&blobs(&[("a", "2"), ("b", "3")])).await;

        let cache = ComposedCache::new(vec![first.clone() as Arc<dyn CacheJson>, second.clone()]);
        let got = cache.get(&ids(&["a", "b", "c"])).await;
        assert_eq!(got, blobs(&[("a", "1"), ("b", "3")]));
        assert!(first.get(&ids(&["b"])).await.is_empty());
    }

    #[stored_requests_macros::tokio_test]
    async fn test_writes_reach_every_layer() {
        let first = Arc::new(UnboundedCache::new());
        let second = Arc::new(UnboundedCache::new());
        let cache = ComposedCache::new(vec![first.clone() as Arc<dyn CacheJson>, second.clone()]);

        cache.save(&blobs(&[("a", "1")])).await;
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);

        cache.invalidate(&ids(&["a"])).await;
        assert!(first.is_empty());
        assert!(second.is_empty());
    }

    #[stored_requests_macros::tokio_test]
    async fn test_empty_composition_holds_nothing() {
        let cache = ComposedCache::default();
        cache.save(&blobs(&[("a", "1")])).await;
        assert!(cache.get(&ids(&["a"])).await.is_empty());
    }
}
