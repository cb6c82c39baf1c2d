//! Assembles the fetchers, caches and event producers described by a [`Config`].
//!
//! Every section of the configuration becomes one [`Pipeline`]:
//!
//! 1. the enabled backends, consulted in the order files, database, HTTP, behind a
//!    [`MultiFetcher`] when there is more than one;
//! 2. a [`CachingFetcher`] over the configured cache;
//! 3. optionally an [`AbFetcher`];
//! 4. the event producers of the section, drained into the cache by one
//!    [`EventListener`].

use std::{sync::Arc, time::Duration};

use axum::Router;
use thiserror::Error;

use crate::{
    backends::{
        DbFetcher, DbProvider, EmptyFetcher, FileFetcher, HttpFetcher, SqlxDbProvider,
    },
    cache::Cache,
    config::{Config, ConfigError, StoredRequestsConfig},
    context::FetchContext,
    error::TracedError,
    events::{
        EventChannels, EventListener, TaskHandle, api,
        database::{DatabaseEventProducer, DatabaseEventsConfig, spawn_polling},
        event_channels,
        http::HttpEvents,
    },
    fetcher::{AbFetcher, AllFetcher, CachingFetcher, DataType, FetchError, MultiFetcher},
    metrics::MetricsEngine,
};

#[derive(Debug, Error)]
pub enum PipelineErrorKind {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot set up {section}: {source}")]
    Backend { section: &'static str, source: FetchError },
    #[error("cannot build the HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

pub type PipelineError = TracedError<PipelineErrorKind>;

impl<E> From<E> for PipelineError
where
    E: Into<PipelineErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

/// The fetcher of one configuration section, with its cache and background tasks.
#[derive(Debug)]
pub struct Pipeline {
    fetcher: Arc<dyn AllFetcher>,
    cache: Cache,
    listener: Option<EventListener>,
    pollers: Vec<TaskHandle>,
}

impl Pipeline {
    pub fn fetcher(&self) -> Arc<dyn AllFetcher> {
        Arc::clone(&self.fetcher)
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Stops the pollers, then the listener.
    pub async fn shutdown(&self) {
        for poller in &self.pollers {
            poller.shutdown().await;
        }
        if let Some(listener) = &self.listener {
            listener.shutdown().await;
        }
    }
}

/// Everything the stored data subsystem runs, built from one [`Config`].
#[derive(Debug)]
pub struct StoredRequests {
    pub requests: Pipeline,
    pub video: Pipeline,
    pub responses: Pipeline,
    pub accounts: Pipeline,
    pub categories: Pipeline,
    router: Router,
    database: Option<Arc<dyn DbProvider>>,
}

/// What every pipeline shares.
struct Shared {
    client: reqwest::Client,
    database: Option<Arc<dyn DbProvider>>,
    metrics: Arc<dyn MetricsEngine>,
}

impl StoredRequests {
    pub async fn new(
        config: &Config,
        metrics: Arc<dyn MetricsEngine>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let client = config.http_client.build_client()?;
        let database = match &config.database {
            Some(connection) => {
                let provider = SqlxDbProvider::connect(
                    connection.driver,
                    &connection.url,
                    connection.max_connections,
                )
                .await
                .map_err(|source| PipelineErrorKind::Backend { section: "database", source })?;
                Some(provider.into_shared())
            }
            None => None,
        };
        let shared = Shared { client, database, metrics };

        let mut router = Router::new();
        let requests = mount(
            "stored_requests",
            DataType::Request,
            &config.stored_requests,
            &shared,
            &mut router,
        )
        .await?;
        let video =
            mount("stored_video", DataType::Request, &config.stored_video, &shared, &mut router)
                .await?;
        let responses = mount(
            "stored_responses",
            DataType::Response,
            &config.stored_responses,
            &shared,
            &mut router,
        )
        .await?;
        let accounts =
            mount("accounts", DataType::Account, &config.accounts, &shared, &mut router).await?;
        let categories = mount(
            "category_mapping",
            DataType::Category,
            &config.category_mapping,
            &shared,
            &mut router,
        )
        .await?;

        Ok(Self {
            requests,
            video,
            responses,
            accounts,
            categories,
            router,
            database: shared.database,
        })
    }

    /// The push API of every section that enables it, mounted at its endpoint.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn pipelines(&self) -> [&Pipeline; 5] {
        [&self.requests, &self.video, &self.responses, &self.accounts, &self.categories]
    }

    /// Stops every poller and listener, then closes the database pool.
    pub async fn shutdown(&self) {
        for pipeline in self.pipelines() {
            pipeline.shutdown().await;
        }
        if let Some(database) = &self.database {
            database.close().await;
        }
        tracing::info!("Stored data subsystem stopped");
    }
}

/// Builds one pipeline, merging its push API, if any, into `router`.
async fn mount(
    section: &'static str,
    data_type: DataType,
    config: &StoredRequestsConfig,
    shared: &Shared,
    router: &mut Router,
) -> Result<Pipeline, PipelineError> {
    let (pipeline, api) = build_pipeline(section, data_type, config, shared)
        .await
        .map_err(|source| PipelineErrorKind::Backend { section, source })?;
    if let Some(api) = api {
        *router = std::mem::take(router).merge(api);
    }
    Ok(pipeline)
}

/// Returns the pipeline and, if enabled, its push API router.
async fn build_pipeline(
    section: &'static str,
    data_type: DataType,
    config: &StoredRequestsConfig,
    shared: &Shared,
) -> Result<(Pipeline, Option<Router>), FetchError> {
    let backend = build_fetcher(section, config, shared).await?;
    let cache = Cache::from_config(&config.in_memory_cache);
    let caching = CachingFetcher::new(backend, cache.clone(), Arc::clone(&shared.metrics));
    let fetcher: Arc<dyn AllFetcher> = match config.ab_testing.enabled {
        true => Arc::new(AbFetcher::new(Arc::new(caching))),
        false => Arc::new(caching),
    };

    let mut producers: Vec<EventChannels> = Vec::new();
    let mut pollers = Vec::new();
    let mut api = None;

    if config.cache_events.enabled {
        let (senders, channels) = event_channels();
        let api_key = config.cache_events.api_key.as_deref().unwrap_or_default();
        let endpoint = config.cache_events.endpoint.as_str();
        tracing::info!(section, endpoint, "Accepting stored data events over HTTP");
        api = Some(Router::new().nest(endpoint, api::router(api_key, senders)));
        producers.push(channels);
    }

    if let Some(endpoint) = &config.http_events.endpoint {
        let (events, channels) =
            HttpEvents::new(shared.client.clone(), endpoint, config.http_events.timeout())?;
        tracing::info!(section, endpoint = endpoint.as_str(), "Polling stored data over HTTP");
        pollers.push(events.start(config.http_events.refresh_rate()));
        producers.push(channels);
    }

    if let (Some(init_query), Some(database)) =
        (&config.database.cache_init_query, &shared.database)
    {
        let queries = &config.database;
        let events_config = DatabaseEventsConfig {
            data_type,
            cache_init_query: init_query.clone(),
            cache_init_timeout: Duration::from_millis(queries.cache_init_timeout_ms),
            update_query: queries.poll_updates_query.clone().unwrap_or_default(),
            update_timeout: Duration::from_millis(queries.poll_timeout_ms),
        };
        let (mut producer, channels) = DatabaseEventProducer::new(
            events_config,
            Arc::clone(database),
            Arc::clone(&shared.metrics),
        );
        match queries.poll_updates_query {
            Some(_) => {
                let refresh_rate = Duration::from_secs(queries.poll_refresh_rate_seconds);
                pollers.push(spawn_polling(producer, refresh_rate));
            }
            None => {
                // a single load, the channel keeps the events after the producer is gone
                if let Err(err) = producer.run(&FetchContext::background()).await {
                    tracing::error!(section, error = %err, "Failed to load stored data caches");
                }
            }
        }
        producers.push(channels);
    }

    let listener = match producers.is_empty() {
        true => None,
        false => Some(EventListener::spawn(cache.clone(), producers)),
    };
    Ok((Pipeline { fetcher, cache, listener, pollers }, api))
}

/// The backends of a section, in priority order.
async fn build_fetcher(
    section: &'static str,
    config: &StoredRequestsConfig,
    shared: &Shared,
) -> Result<Arc<dyn AllFetcher>, FetchError> {
    let mut backends: Vec<Arc<dyn AllFetcher>> = Vec::new();
    if config.files.enabled {
        let path = &config.files.path;
        tracing::info!(
            section,
            path = %path.display(),
            "Loading stored data from the filesystem"
        );
        backends.push(Arc::new(FileFetcher::load(path).await?));
    }
    if let (Some(query), Some(database)) = (&config.database.fetcher_query, &shared.database) {
        tracing::info!(section, query = query.as_str(), "Fetching stored data from the database");
        backends.push(Arc::new(DbFetcher::new(
            Arc::clone(database),
            query.as_str(),
            Arc::clone(&shared.metrics),
        )));
    }
    if let Some(endpoint) = &config.http.endpoint {
        tracing::info!(section, endpoint = endpoint.as_str(), "Fetching stored data over HTTP");
        backends.push(Arc::new(HttpFetcher::new(
            shared.client.clone(),
            endpoint,
            config.http.use_rfc3986_compliant_request_builder,
        )?));
    }

    let fetcher: Arc<dyn AllFetcher> = match backends.len() {
        0 => {
            tracing::warn!(
                section,
                "No stored data backend configured, every ID will be reported missing"
            );
            Arc::new(EmptyFetcher)
        }
        1 => backends.remove(0),
        _ => Arc::new(MultiFetcher::new(backends)),
    };
    Ok(fetcher)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{fetcher::tests::ids, metrics::NoopMetrics};

    #[stored_requests_macros::tokio_test]
    async fn test_empty_config_builds_empty_pipelines() {
        let stored = StoredRequests::new(&Config::default(), Arc::new(NoopMetrics)).await.unwrap();
        let ctx = FetchContext::background();
        let res = stored.requests.fetcher().fetch_requests(&ctx, &ids(&["1"]), &[]).await;
        assert!(res.requests.is_empty());
        assert_eq!(res.errors.len(), 1);
        assert!(res.errors[0].is_not_found());
        assert!(stored.requests.listener.is_none());
        stored.shutdown().await;
    }

    #[stored_requests_macros::tokio_test]
    async fn test_invalid_config_is_rejected() {
        let mut config = Config::default();
        config.accounts.cache_events.enabled = true;
        let err = StoredRequests::new(&config, Arc::new(NoopMetrics)).await.unwrap_err();
        assert!(matches!(err.kind(), PipelineErrorKind::Config(_)));
    }

    #[stored_requests_macros::tokio_test]
    async fn test_missing_files_fail_the_build() {
        let mut config = Config::default();
        config.stored_requests.files.enabled = true;
        config.stored_requests.files.path = "/does/not/exist".into();
        let err = StoredRequests::new(&config, Arc::new(NoopMetrics)).await.unwrap_err();
        assert!(matches!(
            err.kind(),
            PipelineErrorKind::Backend { section: "stored_requests", .. }
        ));
    }
}
