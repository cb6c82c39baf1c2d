//! Pluggable caches for stored data.
//!
//! A cache never fails from the caller's point of view: `get` returns whatever subset of
//! the requested IDs it holds, `save` and `invalidate` return nothing. Problems while
//! storing (an entry too large for a bounded cache, for example) are logged by the
//! implementation, since caching is an optimization and must not affect correctness.
//!
//! # Available Backends
//!
//! - **NoOp** ([`NoOpCache`]): never holds anything. Used to disable caching for a data
//!   type while keeping the [`CachingFetcher`](crate::fetcher::CachingFetcher) code path
//!   uniform.
//! - **Unbounded** ([`UnboundedCache`]): a map behind a read/write lock, without eviction.
//!   Appropriate for small, bounded datasets.
//! - **LRU** ([`LruCache`]): weight-bounded cache with approximate LRU eviction and
//!   optional time to live.
//!
//! Caches can be layered with [`ComposedCache`].

use core::fmt;
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    config::InMemoryCacheConfig,
    fetcher::{DataType, StoredMap},
};

pub mod composed;
pub mod lru;
pub mod noop;
pub mod unbounded;

pub use composed::ComposedCache;
pub use lru::LruCache;
pub use noop::NoOpCache;
pub use unbounded::UnboundedCache;

/// Storage for the JSON blobs of one data type.
///
/// Implementations must be safe for concurrent `get`, `save` and `invalidate` calls: the
/// request path and the event listener write concurrently.
#[async_trait]
pub trait CacheJson: fmt::Debug + Send + Sync {
    /// Returns the cached entries among `ids`. Missing IDs are simply absent from the
    /// result, which never contains keys that were not asked for.
    async fn get(&self, ids: &[String]) -> StoredMap;

    /// Adds or overwrites entries.
    async fn save(&self, data: &StoredMap);

    /// Ensures the values for `ids` are no longer returned until saved again.
    async fn invalidate(&self, ids: &[String]);
}

/// The caches for every data type served by one fetcher pipeline.
#[derive(Debug, Clone)]
pub struct Cache {
    pub requests: Arc<dyn CacheJson>,
    pub imps: Arc<dyn CacheJson>,
    pub responses: Arc<dyn CacheJson>,
    pub accounts: Arc<dyn CacheJson>,
}

impl Cache {
    pub fn noop() -> Self {
        let noop: Arc<dyn CacheJson> = Arc::new(NoOpCache);
        Self {
            requests: Arc::clone(&noop),
            imps: Arc::clone(&noop),
            responses: Arc::clone(&noop),
            accounts: noop,
        }
    }

    pub fn unbounded() -> Self {
        Self {
            requests: Arc::new(UnboundedCache::default()),
            imps: Arc::new(UnboundedCache::default()),
            responses: Arc::new(UnboundedCache::default()),
            accounts: Arc::new(UnboundedCache::default()),
        }
    }

    pub fn from_config(config: &InMemoryCacheConfig) -> Self {
        match config.cache_type {
            CacheType::None => {
                tracing::info!(
                    "No stored data cache configured, the fetcher backends will be used for every lookup"
                );
                Self::noop()
            }
            CacheType::Unbounded => {
                tracing::info!("Using an unbounded in-memory cache for stored data");
                Self::unbounded()
            }
            CacheType::Lru => {
                let ttl = config.ttl();
                tracing::info!(
                    request_bytes = config.request_cache_size_bytes,
                    imp_bytes = config.imp_cache_size_bytes,
                    response_bytes = config.response_cache_size_bytes,
                    account_bytes = config.size_bytes,
                    ?ttl,
                    "Using LRU in-memory caches for stored data"
                );
                Self {
                    requests: lru(config.request_cache_size_bytes, ttl),
                    imps: lru(config.imp_cache_size_bytes, ttl),
                    responses: lru(config.response_cache_size_bytes, ttl),
                    accounts: lru(config.size_bytes, ttl),
                }
            }
        }
    }

    pub fn for_data_type(&self, data_type: DataType) -> Option<&Arc<dyn CacheJson>> {
        match data_type {
            DataType::Request => Some(&self.requests),
            DataType::Imp => Some(&self.imps),
            DataType::Response => Some(&self.responses),
            DataType::Account => Some(&self.accounts),
            DataType::Category => None,
        }
    }
}

/// A size of zero disables caching for that data type.
fn lru(capacity_bytes: u64, ttl: Option<Duration>) -> Arc<dyn CacheJson> {
    match capacity_bytes {
        0 => Arc::new(NoOpCache),
        capacity => Arc::new(LruCache::new(capacity, ttl)),
    }
}

/// Selects the cache implementation in [`InMemoryCacheConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    /// No caching, every lookup goes to the backends.
    #[default]
    None,
    /// Keeps everything forever, until invalidated.
    Unbounded,
    /// Weight-bounded caches, one per data type, with optional expiration.
    Lru,
}

impl CacheType {
    pub fn name(&self) -> &'static str {
        match self {
            CacheType::None => "none",
            CacheType::Unbounded => "unbounded",
            CacheType::Lru => "lru",
        }
    }
}
