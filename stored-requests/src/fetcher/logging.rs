use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{
    AccountFetcher, AllFetcher, CategoryFetcher, FetchError, FetchResult, Fetcher,
    RequestsResult,
};
use crate::context::FetchContext;

/// Wraps a fetcher and remembers every call made to it, with the IDs it was asked for.
#[derive(Debug)]
pub struct LoggingFetcher {
    backend: Arc<dyn AllFetcher>,
    fetch_log: Mutex<Vec<(String, Vec<String>)>>,
}

#[allow(clippy::expect_used)] // this implementation is intended for tests only
impl LoggingFetcher {
    pub fn new(backend: Arc<dyn AllFetcher>) -> Self {
        Self { backend, fetch_log: Mutex::new(Vec::new()) }
    }

    pub fn fetch_operations(&self) -> Vec<(String, Vec<String>)> {
        self.fetch_log.lock().expect("poison lock").clone()
    }

    pub fn clear(&self) {
        self.fetch_log.lock().expect("poison lock").clear();
    }

    fn log(&self, operation: &str, ids: Vec<String>) {
        self.fetch_log.lock().expect("poison lock").push((operation.to_string(), ids));
    }
}

#[async_trait]
impl Fetcher for LoggingFetcher {
    async fn fetch_requests(
        &self,
        ctx: &FetchContext,
        request_ids: &[String],
        imp_ids: &[String],
    ) -> RequestsResult {
        let mut ids = request_ids.to_vec();
        ids.extend(imp_ids.iter().map(|id| format!("imp:{id}")));
        self.log("fetch_requests", ids);
        self.backend.fetch_requests(ctx, request_ids, imp_ids).await
    }

    async fn fetch_responses(&self, ctx: &FetchContext, ids: &[String]) -> FetchResult {
        self.log("fetch_responses", ids.to_vec());
        self.backend.fetch_responses(ctx, ids).await
    }
}

#[async_trait]
impl AccountFetcher for LoggingFetcher {
    async fn fetch_accounts(&self, ctx: &FetchContext, ids: &[String]) -> FetchResult {
        self.log("fetch_accounts", ids.to_vec());
        self.backend.fetch_accounts(ctx, ids).await
    }
}

#[async_trait]
impl CategoryFetcher for LoggingFetcher {
    async fn fetch_categories(
        &self,
        ctx: &FetchContext,
        primary_ad_server: &str,
        publisher_id: &str,
        iab_category: &str,
    ) -> Result<String, FetchError> {
        self.log("fetch_categories", vec![iab_category.to_string()]);
        self.backend.fetch_categories(ctx, primary_ad_server, publisher_id, iab_category).await
    }
}
