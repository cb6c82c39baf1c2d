//! A fetcher running a templated SQL query.
//!
//! The query must return `(id, data, dataType)` rows, `dataType` being one of
//! `request`, `imp`, `response` or `account`. Templates reference the requested IDs
//! with `$REQUEST_ID_LIST` and `$IMP_ID_LIST` for stored requests, and `$ID_LIST` for
//! responses and accounts, for example:
//!
//! ```sql
//! SELECT id, requestData, 'request' AS dataType FROM stored_requests
//!     WHERE id IN $REQUEST_ID_LIST
//! UNION ALL
//! SELECT id, impData, 'imp' AS dataType FROM stored_imps WHERE id IN $IMP_ID_LIST
//! ```

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use tracing::instrument;

use super::db_provider::{DbProvider, ID_LIST, IMP_ID_LIST, QueryParam, REQUEST_ID_LIST};
use crate::{
    context::FetchContext,
    fetcher::{
        AccountFetcher, CategoryFetcher, DataType, FetchError, FetchResult, Fetcher,
        RequestsResult, StoredJson, StoredMap, dedupe_ids, missing_ids_errors,
    },
    metrics::{FetchType, MetricsEngine, StoredDataError, StoredDataLabels},
};

#[derive(Debug, Clone)]
pub struct DbFetcher {
    provider: Arc<dyn DbProvider>,
    query_template: String,
    metrics: Arc<dyn MetricsEngine>,
}

/// Query results split by namespace.
#[derive(Debug, Default)]
struct Rows {
    requests: StoredMap,
    imps: StoredMap,
    responses: StoredMap,
    accounts: StoredMap,
}

impl DbFetcher {
    pub fn new(
        provider: Arc<dyn DbProvider>,
        query_template: impl Into<String>,
        metrics: Arc<dyn MetricsEngine>,
    ) -> Self {
        Self { provider, query_template: query_template.into(), metrics }
    }

    async fn run(
        &self,
        ctx: &FetchContext,
        data_type: DataType,
        params: &[(&str, QueryParam)],
    ) -> Result<Rows, FetchError> {
        let labels = StoredDataLabels { data_type, fetch_type: FetchType::Ids };
        let start = Instant::now();
        let result = self.provider.query(ctx, &self.query_template, params).await;
        self.metrics.record_stored_data_fetch_time(labels, start.elapsed());

        let rows = result.inspect_err(|err| {
            let kind = match err.is_network() {
                true => StoredDataError::Network,
                false => StoredDataError::Undefined,
            };
            self.metrics.record_stored_data_error(labels, kind);
            tracing::error!(%data_type, error = %err.kind(), "Error querying stored data");
        })?;

        let mut split = Rows::default();
        for row in rows {
            let Some(data) = row.data.filter(|data| !data.is_empty() && data != "null") else {
                continue;
            };
            // a broken row must not let lower priority backends answer for its ID
            let json = StoredJson::from_json(&data).map_err(|err| {
                self.metrics.record_stored_data_error(labels, StoredDataError::Undefined);
                let id = row.id.as_str();
                tracing::error!(id, error = %err, "Invalid JSON in stored data row");
                err
            })?;
            let target = match DataType::from_row_type(&row.data_type) {
                Some(DataType::Request) => &mut split.requests,
                Some(DataType::Imp) => &mut split.imps,
                Some(DataType::Response) => &mut split.responses,
                Some(DataType::Account) => &mut split.accounts,
                Some(DataType::Category) | None => {
                    tracing::error!(
                        id = row.id.as_str(),
                        data_type = row.data_type.as_str(),
                        "Stored data row has an unknown dataType, ignoring it"
                    );
                    continue;
                }
            };
            target.insert(row.id, json);
        }
        Ok(split)
    }
}

fn resolve(data_type: DataType, ids: &[String], mut found: StoredMap) -> FetchResult {
    found.retain(|id, _| ids.contains(id));
    let errors = missing_ids_errors(data_type, ids, &found);
    FetchResult { data: found, errors }
}

#[async_trait]
impl Fetcher for DbFetcher {
    #[instrument(skip(self, ctx))]
    async fn fetch_requests(
        &self,
        ctx: &FetchContext,
        request_ids: &[String],
        imp_ids: &[String],
    ) -> RequestsResult {
        let request_ids = dedupe_ids(request_ids);
        let imp_ids = dedupe_ids(imp_ids);
        if request_ids.is_empty() && imp_ids.is_empty() {
            return RequestsResult::default();
        }
        let params = [
            (REQUEST_ID_LIST, QueryParam::IdList(request_ids.clone())),
            (IMP_ID_LIST, QueryParam::IdList(imp_ids.clone())),
        ];
        match self.run(ctx, DataType::Request, &params).await {
            Ok(rows) => {
                let requests = resolve(DataType::Request, &request_ids, rows.requests);
                let imps = resolve(DataType::Imp, &imp_ids, rows.imps);
                let mut errors = requests.errors;
                errors.extend(imps.errors);
                RequestsResult { requests: requests.data, imps: imps.data, errors }
            }
            Err(err) => RequestsResult::from_error(err),
        }
    }

    #[instrument(skip(self, ctx))]
    async fn fetch_responses(&self, ctx: &FetchContext, ids: &[String]) -> FetchResult {
        let ids = dedupe_ids(ids);
        if ids.is_empty() {
            return FetchResult::default();
        }
        let params = [(ID_LIST, QueryParam::IdList(ids.clone()))];
        match self.run(ctx, DataType::Response, &params).await {
            Ok(rows) => resolve(DataType::Response, &ids, rows.responses),
            Err(err) => FetchResult::from_error(err),
        }
    }
}

#[async_trait]
impl AccountFetcher for DbFetcher {
    #[instrument(skip(self, ctx))]
    async fn fetch_accounts(&self, ctx: &FetchContext, ids: &[String]) -> FetchResult {
        let ids = dedupe_ids(ids);
        if ids.is_empty() {
            return FetchResult::default();
        }
        let params = [(ID_LIST, QueryParam::IdList(ids.clone()))];
        match self.run(ctx, DataType::Account, &params).await {
            Ok(rows) => resolve(DataType::Account, &ids, rows.accounts),
            Err(err) => FetchResult::from_error(err),
        }
    }
}

#[async_trait]
impl CategoryFetcher for DbFetcher {
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
