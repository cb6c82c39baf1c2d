//! A fetcher backed by an HTTP endpoint.
//!
//! Requests are a single `GET` carrying the IDs in the query string. In the default
//! mode each namespace is one parameter holding a JSON array of IDs:
//!
//! ```text
//! GET {endpoint}?request-ids=["req-1","req-2"]&imp-ids=["imp-1"]
//! ```
//!
//! With `use_rfc3986_compliant_request_builder`, every ID is its own parameter:
//!
//! ```text
//! GET {endpoint}?request-id=req-1&request-id=req-2&imp-id=imp-1
//! ```
//!
//! The endpoint answers with `{"requests": {...}, "imps": {...}, "responses": {...},
//! "accounts": {...}}`, missing sections being empty. IDs absent from the answer, or
//! mapped to `null`, are reported as not found.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::instrument;
use url::Url;

use crate::{
    context::FetchContext,
    fetcher::{
        AccountFetcher, CategoryFetcher, DataType, FetchError, FetchErrorKind, FetchResult,
        Fetcher, RequestsResult, StoredJson, StoredMap, dedupe_ids, missing_ids_errors,
    },
};

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    requests: HashMap<String, StoredJson>,
    #[serde(default)]
    imps: HashMap<String, StoredJson>,
    #[serde(default)]
    responses: HashMap<String, StoredJson>,
    #[serde(default)]
    accounts: HashMap<String, StoredJson>,
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    endpoint: Url,
    rfc3986_compliant: bool,
}

impl HttpFetcher {
    pub fn new(
        client: reqwest::Client,
        endpoint: &str,
        rfc3986_compliant: bool,
    ) -> Result<Self, FetchError> {
        let endpoint = Url::parse(endpoint)?;
        Ok(Self { client, endpoint, rfc3986_compliant })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// The lookup URL for the given IDs. Empty ID lists are left out of the query.
    pub fn build_url(&self, ids: &[(DataType, &[String])]) -> Result<Url, FetchError> {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            for (data_type, ids) in ids.iter().filter(|(_, ids)| !ids.is_empty()) {
                let key = query_key(*data_type);
                if self.rfc3986_compliant {
                    for id in ids.iter() {
                        query.append_pair(key, id);
                    }
                } else {
                    query.append_pair(&format!("{key}s"), &serde_json::to_string(ids)?);
                }
            }
        }
        Ok(url)
    }

    async fn get(&self, ctx: &FetchContext, url: Url) -> Result<Envelope, FetchError> {
        tracing::debug!(%url, "Fetching stored data over HTTP");
        let response = ctx.run(self.client.get(url).send()).await??;
        let status = response.status();
        let body = ctx.run(response.bytes()).await??;
        if status != reqwest::StatusCode::OK {
            return Err(FetchErrorKind::HttpStatus {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            }
            .into());
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

fn query_key(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Request => "request-id",
        DataType::Imp => "imp-id",
        DataType::Response => "response-id",
        DataType::Account => "account-id",
        DataType::Category => "category-id",
    }
}

/// Keeps the requested, non-null entries and reports everything else as not found.
fn resolve(
    data_type: DataType,
    ids: &[String],
    found: HashMap<String, StoredJson>,
) -> FetchResult {
    let data: StoredMap = found
        .into_iter()
        .filter(|(id, json)| !json.is_null() && ids.contains(id))
        .collect();
    let errors = missing_ids_errors(data_type, ids, &data);
    FetchResult { data, errors }
}

#[async_trait]
impl Fetcher for HttpFetcher {
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
        let query =
            [(DataType::Request, request_ids.as_slice()), (DataType::Imp, imp_ids.as_slice())];
        let envelope = match self.build_url(&query) {
            Ok(url) => self.get(ctx, url).await,
            Err(err) => Err(err),
        };
        match envelope {
            Ok(envelope) => {
                let requests = resolve(DataType::Request, &request_ids, envelope.requests);
                let imps = resolve(DataType::Imp, &imp_ids, envelope.imps);
                let mut errors = requests.errors;
                errors.extend(imps.errors);
                RequestsResult { requests: requests.data, imps: imps.data, errors }
            }
            Err(err) => {
                tracing::warn!(error = %err.kind(), "Error fetching stored requests over HTTP");
                RequestsResult::from_error(err)
            }
        }
    }

    #[instrument(skip(self, ctx))]
    async fn fetch_responses(&self, ctx: &FetchContext, ids: &[String]) -> FetchResult {
        self.fetch_single(ctx, DataType::Response, ids).await
    }
}

impl HttpFetcher {
    async fn fetch_single(
        &self,
        ctx: &FetchContext,
        data_type: DataType,
        ids: &[String],
    ) -> FetchResult {
        let ids = dedupe_ids(ids);
        if ids.is_empty() {
            return FetchResult::default();
        }
        let envelope = match self.build_url(&[(data_type, ids.as_slice())]) {
            Ok(url) => self.get(ctx, url).await,
            Err(err) => Err(err),
        };
        match envelope {
            Ok(mut envelope) => {
                let found = match data_type {
                    DataType::Account => std::mem::take(&mut envelope.accounts),
                    _ => std::mem::take(&mut envelope.responses),
                };
                resolve(data_type, &ids, found)
            }
            Err(err) => {
                tracing::warn!(
                    %data_type,
                    error = %err.kind(),
                    "Error fetching stored data over HTTP"
                );
                FetchResult::from_error(err)
            }
        }
    }
}

#[async_trait]
impl AccountFetcher for HttpFetcher {
    #[instrument(skip(self, ctx))]
    async fn fetch_accounts(&self, ctx: &FetchContext, ids: &[String]) -> FetchResult {
        self.fetch_single(ctx, DataType::Account, ids).await
    }
}

#[async_trait]
impl CategoryFetcher for HttpFetcher {
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
