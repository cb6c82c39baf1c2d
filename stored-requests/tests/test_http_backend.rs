#![allow(clippy::unwrap_used, clippy::expect_used)]
use std::sync::Arc;

use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use stored_requests::{
    AccountFetcher, CategoryFetcher, FetchContext, FetchErrorKind, Fetcher,
    backends::{FileFetcher, HttpFetcher},
    fetcher::{AllFetcher, MultiFetcher},
};

mod common;
use common::{StoredEndpoint, ids, query_map};

const ENVELOPE: &str = r#"{
    "requests": {"1": {"test": "http"}, "2": null},
    "imps": {"a": {"imp": true}, "unasked": {}},
    "responses": {"r": {"seatbid": []}},
    "accounts": {"acc": {"id": "acc"}}
}"#;

#[stored_requests_macros::tokio_test]
async fn test_legacy_query_format() -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = StoredEndpoint::new(ENVELOPE);
    let url = endpoint.start().await;
    let fetcher = HttpFetcher::new(reqwest::Client::new(), &url, false)?;
    let ctx = FetchContext::background();

    let res = fetcher.fetch_requests(&ctx, &ids(&["1", "2"]), &ids(&["a", "b"])).await;
    assert_eq!(res.requests["1"].as_str(), r#"{"test": "http"}"#);
    assert_eq!(res.requests.len(), 1);
    assert_eq!(res.imps.len(), 1);
    let mut missing: Vec<_> = res.errors.iter().filter_map(|e| e.not_found_id()).collect();
    missing.sort();
    assert_eq!(
        missing,
        vec![("2", stored_requests::DataType::Request), ("b", stored_requests::DataType::Imp)]
    );

    let queries = endpoint.queries();
    let query = query_map(&queries[0]);
    assert_eq!(query["request-ids"], vec![r#"["1","2"]"#]);
    assert_eq!(query["imp-ids"], vec![r#"["a","b"]"#]);
    Ok(())
}

#[stored_requests_macros::tokio_test]
async fn test_rfc3986_query_format() -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = StoredEndpoint::new(ENVELOPE);
    let url = endpoint.start().await;
    let fetcher = HttpFetcher::new(reqwest::Client::new(), &url, true)?;
    let ctx = FetchContext::background();

    let res = fetcher.fetch_responses(&ctx, &ids(&["r"])).await;
    assert!(res.errors.is_empty());
    assert_eq!(res.data["r"].as_str(), r#"{"seatbid": []}"#);

    let account = fetcher.fetch_account(&ctx, "acc").await.unwrap();
    assert_eq!(account.as_str(), r#"{"id": "acc"}"#);

    let queries = endpoint.queries();
    assert_eq!(queries[0], vec![("response-id".to_string(), "r".to_string())]);
    assert_eq!(queries[1], vec![("account-id".to_string(), "acc".to_string())]);
    Ok(())
}

#[stored_requests_macros::tokio_test]
async fn test_error_status_is_fetch_wide() -> Result<(), Box<dyn std::error::Error>> {
    let mut endpoint = StoredEndpoint::new("backend exploded");
    endpoint.status = StatusCode::BAD_GATEWAY;
    let url = endpoint.start().await;
    let fetcher = HttpFetcher::new(reqwest::Client::new(), &url, false)?;
    let ctx = FetchContext::background();

    let res = fetcher.fetch_requests(&ctx, &ids(&["1", "2"]), &[]).await;
    assert!(res.requests.is_empty());
    assert_eq!(res.errors.len(), 1);
    match res.errors[0].kind() {
        FetchErrorKind::HttpStatus { status, body } => {
            assert_eq!(*status, 502);
            assert_eq!(body, "backend exploded");
        }
        other => panic!("unexpected error {other}"),
    }
    Ok(())
}

#[stored_requests_macros::tokio_test]
async fn test_empty_ids_make_no_request() -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = StoredEndpoint::new(ENVELOPE);
    let url = endpoint.start().await;
    let fetcher = HttpFetcher::new(reqwest::Client::new(), &url, false)?;
    let ctx = FetchContext::background();

    let res = fetcher.fetch_requests(&ctx, &[], &[]).await;
    assert!(res.errors.is_empty());
    let res = fetcher.fetch_accounts(&ctx, &[]).await;
    assert!(res.errors.is_empty());
    assert!(endpoint.queries().is_empty());
    Ok(())
}

#[stored_requests_macros::tokio_test]
async fn test_files_take_priority_over_http() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    std::fs::create_dir(root.path().join("stored_requests"))?;
    std::fs::write(root.path().join("stored_requests/1.json"), r#"{"test":"foo"}"#)?;
    let files = FileFetcher::load(root.path()).await?;

    let endpoint = StoredEndpoint::new(ENVELOPE);
    let url = endpoint.start().await;
    let http = HttpFetcher::new(reqwest::Client::new(), &url, false)?;

    let backends: Vec<Arc<dyn AllFetcher>> = vec![Arc::new(files), Arc::new(http)];
    let multi = MultiFetcher::new(backends);
    let ctx = FetchContext::background();
    let res = multi.fetch_requests(&ctx, &ids(&["1", "2", "3"]), &[]).await;

    assert_eq!(res.requests["1"].as_str(), r#"{"test":"foo"}"#);
    let mut missing: Vec<_> =
        res.errors.iter().filter_map(|e| e.not_found_id()).map(|(id, _)| id).collect();
    missing.sort();
    assert_eq!(missing, vec!["2", "3"]);

    // only what the files didn't have reaches the endpoint
    let query = query_map(&endpoint.queries()[0]);
    assert_eq!(query["request-ids"], vec![r#"["2","3"]"#]);

    let category = multi.fetch_categories(&ctx, "freewheel", "", "IAB1-1").await;
    assert!(category.unwrap_err().is_not_found());
    Ok(())
}
