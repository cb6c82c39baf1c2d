use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tracing::instrument;

use super::{
    AccountFetcher, AllFetcher, CategoryFetcher, DataType, FetchError, FetchResult, Fetcher,
    RequestsResult, StoredMap, dedupe_ids,
};
use crate::{
    cache::{Cache, CacheJson},
    context::FetchContext,
    metrics::{CacheResult, MetricsEngine},
};

/// A fetcher that serves from [`Cache`] first and only asks its backend for the misses.
///
/// Everything the backend returns is saved into the cache before being merged with the
/// cached entries. Backend errors are returned untouched and never cached. Category
/// lookups are not cached.
#[derive(Debug, Clone)]
pub struct CachingFetcher {
    backend: Arc<dyn AllFetcher>,
    cache: Cache,
    metrics: Arc<dyn MetricsEngine>,
}

impl CachingFetcher {
    pub fn new(
        backend: Arc<dyn AllFetcher>,
        cache: Cache,
        metrics: Arc<dyn MetricsEngine>,
    ) -> Self {
        Self { backend, cache, metrics }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Looks `ids` up in `cache`, returning the hits and the deduplicated misses.
    async fn from_cache(
        &self,
        data_type: DataType,
        cache: &dyn CacheJson,
        ids: &[String],
    ) -> (StoredMap, Vec<String>) {
        if ids.is_empty() {
            return (StoredMap::new(), Vec::new());
        }
        let ids = dedupe_ids(ids);
        let cached = cache.get(&ids).await;
        let missing: Vec<String> =
            ids.into_iter().filter(|id| !cached.contains_key(id)).collect();
        self.metrics.record_cache_result(data_type, CacheResult::Hit, cached.len());
        self.metrics.record_cache_result(data_type, CacheResult::Miss, missing.len());
        (cached, missing)
    }
}

impl fmt::Display for CachingFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CachingFetcher(backend={:?})", self.backend)
    }
}

#[async_trait]
impl Fetcher for CachingFetcher {
    #[instrument(skip(self, ctx))]
    async fn fetch_requests(
        &self,
        ctx: &FetchContext,
        request_ids: &[String],
        imp_ids: &[String],
    ) -> RequestsResult {
        let (mut requests, missing_requests) =
            self.from_cache(DataType::Request, self.cache.requests.as_ref(), request_ids).await;
        let (mut imps, missing_imps) =
            self.from_cache(DataType::Imp, self.cache.imps.as_ref(), imp_ids).await;

        if missing_requests.is_empty() && missing_imps.is_empty() {
            return RequestsResult { requests, imps, errors: Vec::new() };
        }

        let fetched = self.backend.fetch_requests(ctx, &missing_requests, &missing_imps).await;
        self.cache.requests.save(&fetched.requests).await;
        self.cache.imps.save(&fetched.imps).await;
        requests.extend(fetched.requests);
        imps.extend(fetched.imps);
        RequestsResult { requests, imps, errors: fetched.errors }
    }

    #[instrument(skip(self, ctx))]
    async fn fetch_responses(&self, ctx: &FetchContext, ids: &[String]) -> FetchResult {
        let (mut data, missing) =
            self.from_cache(DataType::Response, self.cache.responses.as_ref(), ids).await;
        if missing.is_empty() {
            return FetchResult { data, errors: Vec::new() };
        }

        let fetched = self.backend.fetch_responses(ctx, &missing).await;
        self.cache.responses.save(&fetched.data).await;
        data.extend(fetched.data);
        FetchResult { data, errors: fetched.errors }
    }
}

#[async_trait]
impl AccountFetcher for CachingFetcher {
    #[instrument(skip(self, ctx))]
    async fn fetch_accounts(&self, ctx: &FetchContext, ids: &[String]) -> FetchResult {
        let (mut data, missing) =
            self.from_cache(DataType::Account, self.cache.accounts.as_ref(), ids).await;
        if missing.is_empty() {
            return FetchResult { data, errors: Vec::new() };
        }

        let fetched = self.backend.fetch_accounts(ctx, &missing).await;
        self.cache.accounts.save(&fetched.data).await;
        data.extend(fetched.data);
        FetchResult { data, errors: fetched.errors }
    }
}

#[async_trait]
impl CategoryFetcher for CachingFetcher {
    async fn fetch_categories(
        &self,
        ctx: &FetchContext,
        primary_ad_server: &str,
        publisher_id: &str,
        iab_category: &str,
    ) -> Result<String, FetchError> {
        self.backend.fetch_categories(ctx, primary_ad_server, publisher_id, iab_category).await
    }
}
