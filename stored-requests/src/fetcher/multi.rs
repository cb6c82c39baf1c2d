use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use super::{
    AccountFetcher, AllFetcher, CategoryFetcher, DataType, FetchError, FetchResult, Fetcher,
    RequestsResult, StoredMap, dedupe_ids, missing_ids_errors,
};
use crate::context::FetchContext;

/// Consults several backends in order, each one only for the IDs still unresolved.
///
/// When two backends hold the same ID the earlier one wins. `NotFound` errors from
/// individual backends are dropped, and a single `NotFound` is reported at the end for
/// every ID no backend could supply. Any other error is kept in the result, and the walk
/// goes on with the next backend.
///
/// The context is checked before every backend. If it's cancelled or past its deadline
/// the walk stops and returns what was resolved so far, together with the cancellation
/// error and without `NotFound` errors for the IDs never looked up.
#[derive(Debug, Clone, Default)]
pub struct MultiFetcher {
    backends: Vec<Arc<dyn AllFetcher>>,
}

/// Progress of the walk for one namespace.
#[derive(Debug)]
struct Walk {
    data: StoredMap,
    remaining: Vec<String>,
}

impl Walk {
    fn new(ids: &[String]) -> Self {
        Self { data: StoredMap::new(), remaining: dedupe_ids(ids) }
    }

    fn is_done(&self) -> bool {
        self.remaining.is_empty()
    }

    fn absorb(&mut self, found: StoredMap) {
        for (id, json) in found {
            if self.remaining.contains(&id) {
                self.data.entry(id).or_insert(json);
            }
        }
        let data = &self.data;
        self.remaining.retain(|id| !data.contains_key(id));
    }

    fn finish(self, data_type: DataType, errors: &mut Vec<FetchError>) -> StoredMap {
        errors.extend(missing_ids_errors(data_type, &self.remaining, &self.data));
        self.data
    }
}

fn keep_errors(errors: &mut Vec<FetchError>, found: Vec<FetchError>) {
    errors.extend(found.into_iter().filter(|err| !err.is_not_found()));
}

impl MultiFetcher {
    pub fn new(backends: Vec<Arc<dyn AllFetcher>>) -> Self {
        Self { backends }
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// The walk for namespaces served by a single-list fetch: responses and accounts.
    async fn walk_single(
        &self,
        ctx: &FetchContext,
        data_type: DataType,
        ids: &[String],
    ) -> FetchResult {
        let mut walk = Walk::new(ids);
        let mut errors = Vec::new();
        for backend in &self.backends {
            if walk.is_done() {
                break;
            }
            if let Err(err) = ctx.check() {
                errors.push(err.into());
                return FetchResult { data: walk.data, errors };
            }
            let found = match data_type {
                DataType::Account => backend.fetch_accounts(ctx, &walk.remaining).await,
                _ => backend.fetch_responses(ctx, &walk.remaining).await,
            };
            walk.absorb(found.data);
            keep_errors(&mut errors, found.errors);
        }
        let data = walk.finish(data_type, &mut errors);
        FetchResult { data, errors }
    }
}

#[async_trait]
impl Fetcher for MultiFetcher {
    #[instrument(skip(self, ctx))]
    async fn fetch_requests(
        &self,
        ctx: &FetchContext,
        request_ids: &[String],
        imp_ids: &[String],
    ) -> RequestsResult {
        let mut requests = Walk::new(request_ids);
        let mut imps = Walk::new(imp_ids);
        let mut errors = Vec::new();
        for backend in &self.backends {
            if requests.is_done() && imps.is_done() {
                break;
            }
            if let Err(err) = ctx.check() {
                tracing::debug!(error = %err, "Stopping the backend walk");
                errors.push(err.into());
                return RequestsResult { requests: requests.data, imps: imps.data, errors };
            }
            let found =
                backend.fetch_requests(ctx, &requests.remaining, &imps.remaining).await;
            requests.absorb(found.requests);
            imps.absorb(found.imps);
            keep_errors(&mut errors, found.errors);
        }
        let requests = requests.finish(DataType::Request, &mut errors);
        let imps = imps.finish(DataType::Imp, &mut errors);
        RequestsResult { requests, imps, errors }
    }

    #[instrument(skip(self, ctx))]
    async fn fetch_responses(&self, ctx: &FetchContext, ids: &[String]) -> FetchResult {
        self.walk_single(ctx, DataType::Response, ids).await
    }
}

#[async_trait]
impl AccountFetcher for MultiFetcher {
    #[instrument(skip(self, ctx))]
    async fn fetch_accounts(&self, ctx: &FetchContext, ids: &[String]) -> FetchResult {
        self.walk_single(ctx, DataType::Account, ids).await
    }
}

#[async_trait]
impl CategoryFetcher for MultiFetcher {
    /// Returns the first mapping found, in backend order.
    async fn fetch_categories(
        &self,
        ctx: &FetchContext,
        primary_ad_server: &str,
        publisher_id: &str,
        iab_category: &str,
    ) -> Result<String, FetchError> {
        let mut failure = None;
        for backend in &self.backends {
            ctx.check()?;
            match backend
                .fetch_categories(ctx, primary_ad_server, publisher_id, iab_category)
                .await
            {
                Ok(category) => return Ok(category),
                Err(err) if err.is_not_found() => {}
                Err(err) => failure = Some(err),
            }
        }
        Err(failure.unwrap_or_else(|| FetchError::not_found(iab_category, DataType::Category)))
    }
}
