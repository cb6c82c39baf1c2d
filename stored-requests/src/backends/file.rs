//! A fetcher serving stored data loaded once from a directory tree.
//!
//! The layout is one subdirectory per namespace, each holding `<id>.json` files:
//!
//! ```text
//! root/
//!   stored_requests/<id>.json
//!   stored_imps/<id>.json
//!   stored_responses/<id>.json
//!   accounts/<id>.json
//!   <ad server>/<ad server>.json
//!   <ad server>/<ad server>_<publisher>.json
//! ```
//!
//! Any other subdirectory is a category mapping directory for the ad server it's named
//! after. Files without a `.json` extension are ignored.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::instrument;

use crate::{
    context::FetchContext,
    fetcher::{
        AccountFetcher, CategoryFetcher, DataType, FetchError, FetchErrorKind, FetchResult,
        Fetcher, RequestsResult, StoredJson, StoredMap, dedupe_ids, missing_ids_errors,
    },
};

const REQUESTS_DIR: &str = "stored_requests";
const IMPS_DIR: &str = "stored_imps";
const RESPONSES_DIR: &str = "stored_responses";
const ACCOUNTS_DIR: &str = "accounts";

/// Everything a [`FileFetcher`] serves.
#[derive(Debug, Clone, Default)]
pub struct FileData {
    pub requests: StoredMap,
    pub imps: StoredMap,
    pub responses: StoredMap,
    pub accounts: StoredMap,
    /// Category documents, by ad server and then by file stem.
    pub categories: HashMap<String, StoredMap>,
}

#[derive(Debug, Clone)]
pub struct FileFetcher {
    data: FileData,
}

#[derive(Debug, Deserialize)]
struct CategoryEntry {
    id: String,
}

impl FileFetcher {
    /// Reads every `.json` file under `root`.
    ///
    /// Fails if `root` can't be read or if any file doesn't contain valid JSON; the
    /// error names the offending file.
    pub async fn load(root: impl AsRef<Path>) -> Result<Self, FetchError> {
        let root = root.as_ref();
        let mut data = FileData::default();
        let mut dirs = tokio::fs::read_dir(root).await?;
        while let Some(entry) = dirs.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let files = load_dir(&entry.path()).await?;
            match name.as_str() {
                REQUESTS_DIR => data.requests = files,
                IMPS_DIR => data.imps = files,
                RESPONSES_DIR => data.responses = files,
                ACCOUNTS_DIR => data.accounts = files,
                _ => {
                    data.categories.insert(name, files);
                }
            }
        }
        tracing::info!(
            root = %root.display(),
            requests = data.requests.len(),
            imps = data.imps.len(),
            responses = data.responses.len(),
            accounts = data.accounts.len(),
            category_dirs = data.categories.len(),
            "Loaded stored data from files"
        );
        Ok(Self { data })
    }

    pub fn from_data(data: FileData) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &FileData {
        &self.data
    }

    fn lookup(&self, data_type: DataType, source: &StoredMap, ids: &[String]) -> FetchResult {
        let ids = dedupe_ids(ids);
        let data: StoredMap = ids
            .iter()
            .filter_map(|id| source.get(id).map(|json| (id.clone(), json.clone())))
            .collect();
        let errors = missing_ids_errors(data_type, &ids, &data);
        FetchResult { data, errors }
    }

    fn category_file(&self, ad_server: &str, file: &str, iab: &str) -> Option<String> {
        let json = self.data.categories.get(ad_server)?.get(file)?;
        match json.parse::<HashMap<String, CategoryEntry>>() {
            Ok(mut mappings) => mappings.remove(iab).map(|entry| entry.id),
            Err(err) => {
                tracing::warn!(ad_server, file, error = %err, "Invalid category mapping file");
                None
            }
        }
    }
}

async fn load_dir(dir: &Path) -> Result<StoredMap, FetchError> {
    let mut files = StoredMap::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path: PathBuf = entry.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        let bytes = tokio::fs::read(&path).await?;
        let json = StoredJson::from_slice(&bytes).map_err(|err| {
            FetchErrorKind::Other(format!("invalid JSON in {}: {err}", path.display()))
        })?;
        files.insert(stem, json);
    }
    Ok(files)
}

#[async_trait]
impl Fetcher for FileFetcher {
    #[instrument(skip(self, _ctx))]
    async fn fetch_requests(
        &self,
        _ctx: &FetchContext,
        request_ids: &[String],
        imp_ids: &[String],
    ) -> RequestsResult {
        let requests = self.lookup(DataType::Request, &self.data.requests, request_ids);
        let imps = self.lookup(DataType::Imp, &self.data.imps, imp_ids);
        let mut errors = requests.errors;
        errors.extend(imps.errors);
        RequestsResult { requests: requests.data, imps: imps.data, errors }
    }

    #[instrument(skip(self, _ctx))]
    async fn fetch_responses(&self, _ctx: &FetchContext, ids: &[String]) -> FetchResult {
        self.lookup(DataType::Response, &self.data.responses, ids)
    }
}

#[async_trait]
impl AccountFetcher for FileFetcher {
    async fn fetch_accounts(&self, _ctx: &FetchContext, ids: &[String]) -> FetchResult {
        self.lookup(DataType::Account, &self.data.accounts, ids)
    }
}

#[async_trait]
impl CategoryFetcher for FileFetcher {
    async fn fetch_categories(
        &self,
        _ctx: &FetchContext,
        primary_ad_server: &str,
        publisher_id: &str,
        iab_category: &str,
    ) -> Result<String, FetchError> {
        if !publisher_id.is_empty() {
            let file = format!("{primary_ad_server}_{publisher_id}");
            if let Some(id) = self.category_file(primary_ad_server, &file, iab_category) {
                return Ok(id);
            }
        }
        self.category_file(primary_ad_server, primary_ad_server, iab_category)
            .ok_or_else(|| FetchError::not_found(iab_category, DataType::Category))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn write(root: &Path, dir: &str, file: &str, contents: &str) {
        let dir = root.join(dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(file), contents).unwrap();
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    async fn fixture() -> (TempDir, FileFetcher) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write(root, "stored_requests", "1.json", r#"{"test":"foo"}"#);
        write(root, "stored_requests", "notes.txt", "not json at all");
        write(root, "stored_imps", "imp-1.json", r#"{"id":"imp-1"}"#);
        write(root, "stored_responses", "resp.json", r#"{"seatbid":[]}"#);
        write(root, "accounts", "acc.json", r#"{"disabled":false}"#);
        write(root, "freewheel", "freewheel.json", r#"{"IAB1-1":{"id":"fw-1","name":"Arts"}}"#);
        write(
            root,
            "freewheel",
            "freewheel_pub.json",
            r#"{"IAB1-1":{"id":"pub-1","name":"Arts"}}"#,
        );
        let fetcher = FileFetcher::load(root).await.unwrap();
        (tmp, fetcher)
    }

    #[stored_requests_macros::tokio_test]
    async fn test_resolves_and_reports_missing() {
        let (_tmp, fetcher) = fixture().await;
        let ctx = FetchContext::background();
        let res = fetcher.fetch_requests(&ctx, &ids(&["1", "2"]), &[]).await;

        assert_eq!(res.requests.len(), 1);
        assert_eq!(res.requests["1"].as_str(), r#"{"test":"foo"}"#);
        assert!(res.imps.is_empty());
        assert_eq!(res.errors.len(), 1);
        assert_eq!(res.errors[0].not_found_id(), Some(("2", DataType::Request)));
    }

    #[stored_requests_macros::tokio_test]
    async fn test_duplicated_ids_report_once() {
        let (_tmp, fetcher) = fixture().await;
        let ctx = FetchContext::background();
        let res = fetcher
            .fetch_requests(&ctx, &ids(&["1", "1"]), &ids(&["imp-1", "nope", "nope"]))
            .await;
        assert_eq!(res.requests.len(), 1);
        assert_eq!(res.imps.len(), 1);
        assert_eq!(res.errors.len(), 1);
        assert_eq!(res.errors[0].not_found_id(), Some(("nope", DataType::Imp)));
    }

    #[stored_requests_macros::tokio_test]
    async fn test_other_namespaces() {
        let (_tmp, fetcher) = fixture().await;
        let ctx = FetchContext::background();

        let responses = fetcher.fetch_responses(&ctx, &ids(&["resp"])).await;
        assert_eq!(responses.data.len(), 1);
        assert!(responses.errors.is_empty());

        assert_eq!(
            fetcher.fetch_account(&ctx, "acc").await.unwrap().as_str(),
            r#"{"disabled":false}"#
        );
        let errs = fetcher.fetch_account(&ctx, "other").await.unwrap_err();
        assert_eq!(errs[0].not_found_id(), Some(("other", DataType::Account)));
        assert!(!fetcher.data().requests.contains_key("notes"));
    }

    #[stored_requests_macros::tokio_test]
    async fn test_categories_prefer_publisher_file() {
        let (_tmp, fetcher) = fixture().await;
        let ctx = FetchContext::background();
        let category = fetcher.fetch_categories(&ctx, "freewheel", "pub", "IAB1-1").await;
        assert_eq!(category.unwrap(), "pub-1");
        let category = fetcher.fetch_categories(&ctx, "freewheel", "", "IAB1-1").await;
        assert_eq!(category.unwrap(), "fw-1");
        assert_eq!(
            fetcher.fetch_categories(&ctx, "freewheel", "other", "IAB1-1").await.unwrap(),
            "fw-1"
        );
        let err = fetcher.fetch_categories(&ctx, "freewheel", "", "IAB9").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(fetcher.fetch_categories(&ctx, "dfp", "", "IAB1-1").await.is_err());
    }

    #[stored_requests_macros::tokio_test]
    async fn test_invalid_json_fails_load() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "stored_imps", "broken.json", "{");
        let err = FileFetcher::load(tmp.path()).await.unwrap_err();
        assert!(err.kind().to_string().contains("broken.json"));
    }

    #[stored_requests_macros::tokio_test]
    async fn test_missing_root_fails_load() {
        let tmp = TempDir::new().unwrap();
        let res = FileFetcher::load(tmp.path().join("missing")).await;
        assert!(matches!(res, Err(err) if matches!(err.kind(), FetchErrorKind::Io(_))));
    }
}
