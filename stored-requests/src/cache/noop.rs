//! A cache that holds nothing.

use async_trait::async_trait;

use super::CacheJson;
use crate::fetcher::StoredMap;

/// Never stores any value.
///
/// Every `get` returns an empty map, so a [`CachingFetcher`](crate::fetcher::CachingFetcher)
/// wrapping this cache forwards every lookup to its backend. This is what the `none`
/// cache type resolves to.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpCache;

#[async_trait]
impl CacheJson for NoOpCache {
    async fn get(&self, _ids: &[String]) -> StoredMap {
        StoredMap::new()
    }

    async fn save(&self, _data: &StoredMap) {}

    async fn invalidate(&self, _ids: &[String]) {}
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::cache::tests::{blobs, ids};

    #[stored_requests_macros::tokio_test]
    async fn test_noop_never_returns_saved_data() {
        let cache = NoOpCache;
        cache.save(&blobs(&[("a", "{}")])).await;
        assert!(cache.get(&ids(&["a"])).await.is_empty());
        cache.invalidate(&ids(&["a"])).await;
        assert!(cache.get(&ids(&[])).await.is_empty());
    }
}
