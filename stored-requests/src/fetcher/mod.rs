//! The fetch-by-ID contract shared by every backend and decorator.
//!
//! A fetch never fails as a whole: it returns whatever could be resolved together with a
//! list of errors. Every requested ID ends up either as a key of the returned data or as
//! exactly one [`FetchErrorKind::NotFound`] error, unless a fetch-wide error (network,
//! database, cancellation) is present, in which case callers must assume the missing IDs
//! were not looked up at all.

use core::fmt;
use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use itertools::Itertools;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::value::RawValue;

use crate::context::FetchContext;

pub mod ab;
pub mod caching;
pub mod errors;
#[cfg(test)]
pub mod logging;
pub mod multi;

pub use ab::AbFetcher;
pub use caching::CachingFetcher;
pub use errors::{FetchError, FetchErrorKind};
pub use multi::MultiFetcher;

/// The independent ID namespaces of stored data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Request,
    Imp,
    Response,
    Account,
    Category,
}

impl DataType {
    /// Parses the `dataType` column of database rows.
    pub fn from_row_type(value: &str) -> Option<Self> {
        match value {
            "request" => Some(DataType::Request),
            "imp" => Some(DataType::Imp),
            "response" => Some(DataType::Response),
            "account" => Some(DataType::Account),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::Request => "Request",
            DataType::Imp => "Imp",
            DataType::Response => "Response",
            DataType::Account => "Account",
            DataType::Category => "Category",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An immutable, opaque JSON document.
///
/// Cloning is cheap, the text is shared. The document is validated as JSON when the
/// value is created but its contents are never interpreted by this crate, except by the
/// A/B fetcher.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoredJson(Arc<RawValue>);

impl StoredJson {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self(Arc::from(RawValue::from_string(json.to_string())?)))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: Box<RawValue> = serde_json::from_slice(bytes)?;
        Ok(Self(Arc::from(raw)))
    }

    pub fn from_value<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self(Arc::from(serde_json::value::to_raw_value(value)?)))
    }

    pub fn as_str(&self) -> &str {
        self.0.get()
    }

    pub fn len(&self) -> usize {
        self.as_str().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_str().is_empty()
    }

    pub fn is_null(&self) -> bool {
        self.as_str() == "null"
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.as_str())
    }
}

impl PartialEq for StoredJson {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for StoredJson {}

impl fmt::Debug for StoredJson {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoredJson({})", self.as_str())
    }
}

impl fmt::Display for StoredJson {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type StoredMap = HashMap<String, StoredJson>;

/// Data for one namespace, plus per-ID and fetch-wide errors.
#[derive(Debug, Default)]
pub struct FetchResult {
    pub data: StoredMap,
    pub errors: Vec<FetchError>,
}

impl FetchResult {
    pub fn from_error(error: impl Into<FetchError>) -> Self {
        Self { data: StoredMap::new(), errors: vec![error.into()] }
    }
}

#[derive(Debug, Default)]
pub struct RequestsResult {
    pub requests: StoredMap,
    pub imps: StoredMap,
    pub errors: Vec<FetchError>,
}

impl RequestsResult {
    pub fn from_error(error: impl Into<FetchError>) -> Self {
        Self { errors: vec![error.into()], ..Default::default() }
    }
}

/// Fetches stored requests, stored imps and stored responses by ID.
///
/// Implementations must be safe for concurrent use, callers are expected to share one
/// instance. Returned blobs are read only.
#[async_trait]
pub trait Fetcher: fmt::Debug + Send + Sync {
    async fn fetch_requests(
        &self,
        ctx: &FetchContext,
        request_ids: &[String],
        imp_ids: &[String],
    ) -> RequestsResult;

    async fn fetch_responses(&self, ctx: &FetchContext, ids: &[String]) -> FetchResult;
}

#[async_trait]
pub trait AccountFetcher: fmt::Debug + Send + Sync {
    async fn fetch_accounts(&self, ctx: &FetchContext, ids: &[String]) -> FetchResult;

    async fn fetch_account(
        &self,
        ctx: &FetchContext,
        account_id: &str,
    ) -> Result<StoredJson, Vec<FetchError>> {
        if account_id.is_empty() {
            return Err(vec![FetchErrorKind::Other("empty account id".to_string()).into()]);
        }
        let FetchResult { mut data, errors } =
            self.fetch_accounts(ctx, &[account_id.to_string()]).await;
        match data.remove(account_id) {
            Some(account) => Ok(account),
            None if errors.is_empty() => {
                Err(vec![FetchError::not_found(account_id, DataType::Account)])
            }
            None => Err(errors),
        }
    }
}

#[async_trait]
pub trait CategoryFetcher: fmt::Debug + Send + Sync {
    /// Maps an IAB category to the ad server specific category ID.
    async fn fetch_categories(
        &self,
        ctx: &FetchContext,
        primary_ad_server: &str,
        publisher_id: &str,
        iab_category: &str,
    ) -> Result<String, FetchError>;
}

pub trait AllFetcher: Fetcher + AccountFetcher + CategoryFetcher {}

impl<T: Fetcher + AccountFetcher + CategoryFetcher> AllFetcher for T {}

/// Removes duplicated IDs, keeping the first occurrence order.
pub fn dedupe_ids(ids: &[String]) -> Vec<String> {
    ids.iter().unique().cloned().collect()
}

/// One `NotFound` error per ID in `ids` that has no entry in `data`.
pub fn missing_ids_errors(
    data_type: DataType,
    ids: &[String],
    data: &StoredMap,
) -> Vec<FetchError> {
    ids.iter()
        .unique()
        .filter(|id| !data.contains_key(id.as_str()))
        .map(|id| FetchError::not_found(id.as_str(), data_type))
        .collect()
}

/// Keeps only the entries of `data` that were asked for.
pub(crate) fn retain_requested(data: &mut StoredMap, ids: &[String]) {
    data.retain(|id, _| ids.contains(id));
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::backends::file::{FileData, FileFetcher};

    pub(crate) fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    pub(crate) fn stored(values: &[(&str, &str)]) -> StoredMap {
        values
            .iter()
            .map(|(id, json)| (id.to_string(), StoredJson::from_json(json).unwrap()))
            .collect()
    }

    /// A fetcher holding requests `1`, `2`, imps `a`, `b`, response `r` and account `acc`.
    pub(crate) fn memory_fetcher() -> FileFetcher {
        FileFetcher::from_data(FileData {
            requests: stored(&[("1", r#"{"id":"1"}"#), ("2", r#"{"id":"2"}"#)]),
            imps: stored(&[("a", r#"{"id":"a"}"#), ("b", r#"{"id":"b"}"#)]),
            responses: stored(&[("r", r#"{"seatbid":[]}"#)]),
            accounts: stored(&[("acc", r#"{"id":"acc"}"#)]),
            ..Default::default()
        })
    }

    #[stored_requests_macros::test]
    fn test_stored_json_keeps_text() {
        let json = StoredJson::from_json(r#"{"b": 1, "a": [true]}"#).unwrap();
        assert_eq!(json.as_str(), r#"{"b": 1, "a": [true]}"#);
        assert!(StoredJson::from_json("{not json").is_err());
        assert!(StoredJson::from_json("null").unwrap().is_null());
    }

    #[stored_requests_macros::test]
    fn test_not_found_message() {
        let err = FetchError::not_found("2", DataType::Request);
        assert!(err.is_not_found());
        assert_eq!(err.kind().to_string(), r#"Stored Request with ID="2" not found."#);
        assert_eq!(err.not_found_id(), Some(("2", DataType::Request)));
    }

    #[stored_requests_macros::test]
    fn test_missing_ids_errors_dedupes() {
        let ids: Vec<String> = ["a", "b", "b", "c"].iter().map(|s| s.to_string()).collect();
        let data = StoredMap::from([("a".to_string(), StoredJson::from_json("1").unwrap())]);
        let missing: Vec<_> = missing_ids_errors(DataType::Imp, &ids, &data)
            .iter()
            .filter_map(|e| e.not_found_id().map(|(id, _)| id.to_string()))
            .collect();
        assert_eq!(missing, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(dedupe_ids(&ids), vec!["a", "b", "c"]);
    }
}
