use std::{path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{backends::DbDriver, cache::CacheType, error::TracedError};

#[derive(Debug, Error)]
pub enum ConfigErrorKind {
    #[error("cannot read configuration file {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
    #[error("{section}: {message}")]
    Invalid { section: &'static str, message: String },
}

pub type ConfigError = TracedError<ConfigErrorKind>;

impl<E> From<E> for ConfigError
where
    E: Into<ConfigErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

fn invalid(section: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigErrorKind::Invalid { section, message: message.into() }.into()
}

/// Every stored data pipeline, plus the connections they share.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Stored requests and stored imps for the auction endpoint.
    pub stored_requests: StoredRequestsConfig,
    /// Stored requests and stored imps for the video endpoint.
    pub stored_video: StoredRequestsConfig,
    pub stored_responses: StoredRequestsConfig,
    pub accounts: StoredRequestsConfig,
    pub category_mapping: StoredRequestsConfig,
    /// The only database connection, used by every pipeline that has queries.
    pub database: Option<DatabaseConnection>,
    pub http_client: HttpClientConfig,
}

impl Config {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|source| ConfigErrorKind::Io { path: path.to_path_buf(), source })?;
        Self::from_yaml_str(&yaml)
    }

    /// The pipelines, with the name of their section.
    pub fn pipelines(&self) -> [(&'static str, &StoredRequestsConfig); 5] {
        [
            ("stored_requests", &self.stored_requests),
            ("stored_video", &self.stored_video),
            ("stored_responses", &self.stored_responses),
            ("accounts", &self.accounts),
            ("category_mapping", &self.category_mapping),
        ]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (section, pipeline) in self.pipelines() {
            pipeline.validate(section)?;
            if pipeline.database.is_configured() && self.database.is_none() {
                return Err(invalid(section, "database queries require a database connection"));
            }
        }
        let no_ab = [("accounts", &self.accounts), ("category_mapping", &self.category_mapping)];
        for (section, pipeline) in no_ab {
            if pipeline.ab_testing.enabled {
                return Err(invalid(section, "A/B testing only applies to stored requests"));
            }
        }
        let mut endpoints = Vec::new();
        for (section, pipeline) in self.pipelines() {
            if !pipeline.cache_events.enabled {
                continue;
            }
            let endpoint = pipeline.cache_events.endpoint.as_str();
            if !endpoint.starts_with('/') || endpoint == "/" {
                return Err(invalid(section, "cache_events.endpoint must be a path below /"));
            }
            if endpoints.contains(&endpoint) {
                return Err(invalid(section, "cache_events.endpoint is already in use"));
            }
            endpoints.push(endpoint);
        }
        if let Some(database) = &self.database {
            if database.url.is_empty() {
                return Err(invalid("database", "url is required"));
            }
            if database.max_connections == 0 {
                return Err(invalid("database", "max_connections must be positive"));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConnection {
    pub driver: DbDriver,
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    pub timeout_ms: u64,
    pub max_idle_connections_per_host: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self { timeout_ms: 2_000, max_idle_connections_per_host: 10 }
    }
}

impl HttpClientConfig {
    pub fn build_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .timeout(Duration::from_millis(self.timeout_ms))
            .pool_max_idle_per_host(self.max_idle_connections_per_host)
            .build()
    }
}

/// One fetcher pipeline: its backends, its cache and the producers refreshing it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredRequestsConfig {
    pub files: FilesConfig,
    pub database: DatabaseQueriesConfig,
    pub http: HttpFetcherConfig,
    pub http_events: HttpEventsConfig,
    pub cache_events: CacheEventsConfig,
    pub in_memory_cache: InMemoryCacheConfig,
    pub ab_testing: AbTestingConfig,
}

impl StoredRequestsConfig {
    pub fn validate(&self, section: &'static str) -> Result<(), ConfigError> {
        if self.cache_events.enabled
            && self.cache_events.api_key.as_deref().is_none_or(str::is_empty)
        {
            return Err(invalid(section, "cache_events requires an api_key"));
        }
        if self.http_events.endpoint.is_some() && self.http_events.refresh_rate_seconds == 0 {
            return Err(invalid(section, "http_events.refresh_rate_seconds must be positive"));
        }
        if self.database.poll_updates_query.is_some() {
            if self.database.cache_init_query.is_none() {
                return Err(invalid(section, "poll_updates_query requires a cache_init_query"));
            }
            if self.database.poll_refresh_rate_seconds == 0 {
                return Err(invalid(section, "poll_refresh_rate_seconds must be positive"));
            }
            if self.database.poll_timeout_ms == 0 {
                return Err(invalid(section, "poll_timeout_ms must be positive"));
            }
        }
        let has_events = self.cache_events.enabled
            || self.http_events.endpoint.is_some()
            || self.database.cache_init_query.is_some();
        if has_events && self.in_memory_cache.cache_type == CacheType::None {
            return Err(invalid(section, "cache events require an in_memory_cache"));
        }
        self.in_memory_cache.validate(section)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseQueriesConfig {
    /// Fetches by ID, see [`DbFetcher`](crate::backends::DbFetcher).
    pub fetcher_query: Option<String>,
    /// Loads every row at startup.
    pub cache_init_query: Option<String>,
    pub cache_init_timeout_ms: u64,
    /// Loads the rows changed since `$LAST_UPDATED`.
    pub poll_updates_query: Option<String>,
    pub poll_refresh_rate_seconds: u64,
    pub poll_timeout_ms: u64,
}

impl Default for DatabaseQueriesConfig {
    fn default() -> Self {
        Self {
            fetcher_query: None,
            cache_init_query: None,
            cache_init_timeout_ms: 5_000,
            poll_updates_query: None,
            poll_refresh_rate_seconds: 60,
            poll_timeout_ms: 1_000,
        }
    }
}

impl DatabaseQueriesConfig {
    pub fn is_configured(&self) -> bool {
        self.fetcher_query.is_some()
            || self.cache_init_query.is_some()
            || self.poll_updates_query.is_some()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpFetcherConfig {
    pub endpoint: Option<String>,
    /// Sends repeated `request-id=...` parameters instead of JSON arrays.
    pub use_rfc3986_compliant_request_builder: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpEventsConfig {
    pub endpoint: Option<String>,
    pub refresh_rate_seconds: u64,
    pub timeout_ms: u64,
}

impl Default for HttpEventsConfig {
    fn default() -> Self {
        Self { endpoint: None, refresh_rate_seconds: 60, timeout_ms: 1_000 }
    }
}

impl HttpEventsConfig {
    pub fn refresh_rate(&self) -> Duration {
        Duration::from_secs(self.refresh_rate_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheEventsConfig {
    pub enabled: bool,
    /// Where the push API is mounted, for example `/storedrequests/openrtb2`.
    pub endpoint: String,
    pub api_key: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryCacheConfig {
    #[serde(rename = "type")]
    pub cache_type: CacheType,
    /// Zero disables expiration.
    pub ttl_seconds: u64,
    /// Capacity of the account cache. For `lru` caches, a zero size disables caching of
    /// that data type, as do the other sizes below.
    pub size_bytes: u64,
    pub request_cache_size_bytes: u64,
    pub imp_cache_size_bytes: u64,
    pub response_cache_size_bytes: u64,
}

impl InMemoryCacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        match self.ttl_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    fn validate(&self, section: &'static str) -> Result<(), ConfigError> {
        match self.cache_type {
            CacheType::None => Ok(()),
            CacheType::Unbounded if self.ttl_seconds != 0 => {
                Err(invalid(section, "in_memory_cache.ttl_seconds must be 0 for unbounded caches"))
            }
            CacheType::Unbounded => Ok(()),
            CacheType::Lru => {
                let sizes = [
                    self.size_bytes,
                    self.request_cache_size_bytes,
                    self.imp_cache_size_bytes,
                    self.response_cache_size_bytes,
                ];
                if sizes.iter().all(|size| *size == 0) {
                    return Err(invalid(section, "lru caches need a positive size"));
                }
                Ok(())
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbTestingConfig {
    pub enabled: bool,
}
