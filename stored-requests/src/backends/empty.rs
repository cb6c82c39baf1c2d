use async_trait::async_trait;

use crate::{
    context::FetchContext,
    fetcher::{
        AccountFetcher, CategoryFetcher, DataType, FetchError, FetchResult, Fetcher,
        RequestsResult, StoredMap, missing_ids_errors,
    },
};

/// The fetcher used when no backend is configured: every ID is reported as not found.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyFetcher;

#[async_trait]
impl Fetcher for EmptyFetcher {
    async fn fetch_requests(
        &self,
        _ctx: &FetchContext,
        request_ids: &[String],
        imp_ids: &[String],
    ) -> RequestsResult {
        let mut errors = missing_ids_errors(DataType::Request, request_ids, &StoredMap::new());
        errors.extend(missing_ids_errors(DataType::Imp, imp_ids, &StoredMap::new()));
        RequestsResult { errors, ..Default::default() }
    }

    async fn fetch_responses(&self, _ctx: &FetchContext, ids: &[String]) -> FetchResult {
        FetchResult {
            data: StoredMap::new(),
            errors: missing_ids_errors(DataType::Response, ids, &StoredMap::new()),
        }
    }
}

#[async_trait]
impl AccountFetcher for EmptyFetcher {
    async fn fetch_accounts(&self, _ctx: &FetchContext, ids: &[String]) -> FetchResult {
        FetchResult {
            data: StoredMap::new(),
            errors: missing_ids_errors(DataType::Account, ids, &StoredMap::new()),
        }
    }
}

#[async_trait]
impl CategoryFetcher for EmptyFetcher {
    async fn fetch_categories(
        &self,
        _ctx: &FetchContext,
        _primary_ad_server: &str,
        _publisher_id: &str,
        iab_category: &str,
    ) -> Result<String, FetchError> {
        Err(FetchError::not_found(iab_category, DataType::Category))
    }
}
