//! A/B experiments on stored requests.
//!
//! A stored request can embed experiment descriptors under `ext.prebid.ab_config`:
//!
//! ```json
//! {"ext": {"prebid": {"ab_config": [
//!     {"code": "new-floors", "ratio": 10, "request_id": "req-v2"},
//!     {"code": "new-imps", "ratio": 5, "imp_ids": {"imp-1": "imp-1-v2"}}
//! ]}}}
//! ```
//!
//! For every fetch of exactly one stored request, [`AbFetcher`] draws a number in
//! `[0, 100)` and selects the first descriptor whose cumulative ratio exceeds it. Draws
//! above the sum of all ratios select nothing, the control group. A selected descriptor
//! replaces the stored request and/or some stored imps with other stored objects, and
//! the returned request is tagged with `ext.prebid.ab_code`.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::instrument;

use super::{
    AccountFetcher, AllFetcher, CategoryFetcher, DataType, FetchError, FetchErrorKind,
    FetchResult, Fetcher, RequestsResult, StoredJson, dedupe_ids,
};
use crate::context::FetchContext;

const AB_CONFIG_POINTER: &str = "/ext/prebid/ab_config";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbConfig {
    #[serde(default)]
    pub code: String,
    pub ratio: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Original imp ID to replacement imp ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imp_ids: Option<BTreeMap<String, String>>,
}

/// Checks the invariants of an experiment list.
pub fn validate_ab_configs(configs: &[AbConfig]) -> Result<(), FetchErrorKind> {
    let mut codes = HashSet::new();
    let mut total = 0.0;
    for config in configs {
        if config.code.is_empty() {
            return Err(FetchErrorKind::InvalidAbConfig("missing code".to_string()));
        }
        if !codes.insert(config.code.as_str()) {
            return Err(FetchErrorKind::InvalidAbConfig(format!(
                "duplicated code {}",
                config.code
            )));
        }
        if !config.ratio.is_finite() || config.ratio < 0.0 {
            return Err(FetchErrorKind::InvalidAbConfig(format!(
                "invalid ratio {} for code {}",
                config.ratio, config.code
            )));
        }
        if config.request_id.is_none() && config.imp_ids.is_none() {
            return Err(FetchErrorKind::InvalidAbConfig(format!(
                "code {} replaces neither the request nor any imp",
                config.code
            )));
        }
        total += config.ratio;
    }
    if total > 100.0 {
        return Err(FetchErrorKind::InvalidAbConfig(format!(
            "ratios add up to {total}, more than 100"
        )));
    }
    Ok(())
}

/// The descriptor selected by `draw`, a number in `[0, 100)`, or `None` for the control
/// group.
pub fn select_ab_config(configs: &[AbConfig], draw: f64) -> Option<&AbConfig> {
    let mut cumulative = 0.0;
    configs.iter().find(|config| {
        cumulative += config.ratio;
        cumulative > draw
    })
}

/// Wraps a fetcher to run the A/B experiments embedded in stored requests.
///
/// Only `fetch_requests` is affected, and only when exactly one stored request ID is
/// requested. Invalid experiment lists are reported as errors next to the unmodified
/// data. If fetching the replacement objects fails, the whole result is discarded and
/// only the errors are returned.
#[derive(Debug)]
pub struct AbFetcher {
    inner: Arc<dyn AllFetcher>,
    rng: Mutex<StdRng>,
}

impl AbFetcher {
    pub fn new(inner: Arc<dyn AllFetcher>) -> Self {
        Self { inner, rng: Mutex::new(StdRng::from_os_rng()) }
    }

    /// An instance with reproducible draws.
    pub fn with_seed(inner: Arc<dyn AllFetcher>, seed: u64) -> Self {
        Self { inner, rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }

    fn draw(&self) -> f64 {
        // the generator state is valid even if a holder panicked
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.random_range(0.0..100.0)
    }

    /// Applies `config` to `result`, which holds `request` under `request_id`.
    async fn apply(
        &self,
        ctx: &FetchContext,
        request_id: &str,
        mut request: Value,
        config: &AbConfig,
        imp_ids: &[String],
        mut result: RequestsResult,
    ) -> RequestsResult {
        if let Some(replacement_id) = &config.request_id {
            let mut fetched =
                self.inner.fetch_requests(ctx, std::slice::from_ref(replacement_id), &[]).await;
            let replacement = fetched.requests.remove(replacement_id);
            let replacement = match replacement.map(|json| json.parse::<Value>()) {
                Some(Ok(value)) if fetched.errors.is_empty() => value,
                Some(Err(err)) => return RequestsResult::from_error(err),
                _ => return fail_closed(fetched.errors, replacement_id),
            };
            request = replacement;
            let selected = match serde_json::to_value(vec![config]) {
                Ok(selected) => selected,
                Err(err) => return RequestsResult::from_error(err),
            };
            if let Err(err) = set_ext_prebid(&mut request, "ab_config", selected) {
                return RequestsResult::from_error(err);
            }
        }

        if let Some(replacements) = &config.imp_ids {
            let swaps: Vec<(&String, &String)> = replacements
                .iter()
                .filter(|(original, _)| imp_ids.contains(original))
                .collect();
            if !swaps.is_empty() {
                let wanted: Vec<String> =
                    swaps.iter().map(|(_, replacement)| replacement.to_string()).collect();
                let mut fetched = self.inner.fetch_requests(ctx, &[], &wanted).await;
                if !fetched.errors.is_empty() {
                    return RequestsResult { errors: fetched.errors, ..Default::default() };
                }
                for (original, replacement) in swaps {
                    match fetched.imps.remove(replacement) {
                        Some(imp) => {
                            // the original imp may not exist on its own
                            result.errors.retain(|err| {
                                err.not_found_id() != Some((original.as_str(), DataType::Imp))
                            });
                            result.imps.insert(original.clone(), imp);
                        }
                        None => return fail_closed(Vec::new(), replacement),
                    }
                }
            }
        }

        let code = Value::from(config.code.clone());
        if let Err(err) = set_ext_prebid(&mut request, "ab_code", code) {
            return RequestsResult::from_error(err);
        }
        match StoredJson::from_value(&request) {
            Ok(json) => {
                result.requests.insert(request_id.to_string(), json);
                result
            }
            Err(err) => RequestsResult::from_error(err),
        }
    }
}

fn fail_closed(mut errors: Vec<FetchError>, missing: &str) -> RequestsResult {
    if errors.is_empty() {
        errors.push(FetchErrorKind::Other(format!("A/B replacement {missing} not found")).into());
    }
    RequestsResult { errors, ..Default::default() }
}

fn set_ext_prebid(request: &mut Value, key: &str, value: Value) -> Result<(), FetchErrorKind> {
    let not_an_object =
        || FetchErrorKind::InvalidAbConfig("stored request is not a JSON object".to_string());
    let ext = request
        .as_object_mut()
        .ok_or_else(not_an_object)?
        .entry("ext")
        .or_insert_with(|| Value::Object(Map::new()));
    let prebid = ext
        .as_object_mut()
        .ok_or_else(not_an_object)?
        .entry("prebid")
        .or_insert_with(|| Value::Object(Map::new()));
    prebid.as_object_mut().ok_or_else(not_an_object)?.insert(key.to_string(), value);
    Ok(())
}

#[async_trait]
impl Fetcher for AbFetcher {
    #[instrument(skip(self, ctx))]
    async fn fetch_requests(
        &self,
        ctx: &FetchContext,
        request_ids: &[String],
        imp_ids: &[String],
    ) -> RequestsResult {
        let mut result = self.inner.fetch_requests(ctx, request_ids, imp_ids).await;
        let request_ids = dedupe_ids(request_ids);
        let [request_id] = request_ids.as_slice() else {
            return result;
        };
        let Some(stored) = result.requests.get(request_id) else {
            return result;
        };
        let request: Value = match stored.parse() {
            Ok(request) => request,
            // stored data is opaque here, it's not our job to reject it
            Err(_) => return result,
        };
        let Some(raw_configs) = request.pointer(AB_CONFIG_POINTER) else {
            return result;
        };

        let configs = serde_json::from_value::<Vec<AbConfig>>(raw_configs.clone())
            .map_err(|err| FetchErrorKind::InvalidAbConfig(err.to_string()))
            .and_then(|configs| validate_ab_configs(&configs).map(|_| configs));
        let configs = match configs {
            Ok(configs) => configs,
            Err(err) => {
                tracing::warn!(
                    request_id = request_id.as_str(),
                    error = %err,
                    "Invalid A/B configuration"
                );
                result.errors.push(err.into());
                return result;
            }
        };

        let draw = self.draw();
        let Some(config) = select_ab_config(&configs, draw) else {
            tracing::debug!(request_id = request_id.as_str(), draw, "A/B control group");
            return result;
        };
        tracing::debug!(
            request_id = request_id.as_str(),
            code = config.code.as_str(),
            "A/B variant selected"
        );
        self.apply(ctx, request_id, request, config, imp_ids, result).await
    }

    async fn fetch_responses(&self, ctx: &FetchContext, ids: &[String]) -> FetchResult {
        self.inner.fetch_responses(ctx, ids).await
    }
}

#[async_trait]
impl AccountFetcher for AbFetcher {
    async fn fetch_accounts(&self, ctx: &FetchContext, ids: &[String]) -> FetchResult {
        self.inner.fetch_accounts(ctx, ids).await
    }
}

#[async_trait]
impl CategoryFetcher for AbFetcher {
    async fn fetch_categories(
        &self,
        ctx: &FetchContext,
        primary_ad_server: &str,
        publisher_id: &str,
        iab_category: &str,
    ) -> Result<String, FetchError> {
        self.inner.fetch_categories(ctx, primary_ad_server, publisher_id, iab_category).await
    }
}
