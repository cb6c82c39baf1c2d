#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    routing::get,
};

/// Starts `app` on an ephemeral local port and returns its base URL.
pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}")
}

/// A stored data endpoint answering with a fixed body and recording every query string.
#[derive(Debug, Clone)]
pub struct StoredEndpoint {
    pub status: StatusCode,
    pub body: Arc<Mutex<String>>,
    pub queries: Arc<Mutex<Vec<Vec<(String, String)>>>>,
}

impl StoredEndpoint {
    pub fn new(body: &str) -> Self {
        Self {
            status: StatusCode::OK,
            body: Arc::new(Mutex::new(body.to_string())),
            queries: Arc::default(),
        }
    }

    pub fn set_body(&self, body: &str) {
        *self.body.lock().unwrap() = body.to_string();
    }

    pub fn queries(&self) -> Vec<Vec<(String, String)>> {
        self.queries.lock().unwrap().clone()
    }

    /// Serves the endpoint at `{base}/stored`.
    pub async fn start(&self) -> String {
        async fn handler(
            State(endpoint): State<StoredEndpoint>,
            Query(query): Query<Vec<(String, String)>>,
        ) -> (StatusCode, String) {
            endpoint.queries.lock().unwrap().push(query);
            (endpoint.status, endpoint.body.lock().unwrap().clone())
        }
        let app = Router::new().route("/stored", get(handler)).with_state(self.clone());
        format!("{}/stored", serve(app).await)
    }
}

pub fn query_map(query: &[(String, String)]) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in query {
        map.entry(key.clone()).or_default().push(value.clone());
    }
    map
}

pub fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

/// Retries `check` until it holds, for up to two seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}
