//! Polling of a database for stored data changes.
//!
//! The first run executes the "load all" query and saves every row. Later runs execute
//! the "update" query, binding `$LAST_UPDATED` to the start time of the last successful
//! run. In an update, a row with `NULL` or empty data invalidates its ID, any other row
//! is saved. A row that can't be decoded or holds invalid JSON discards the whole batch,
//! and the watermark is kept so the next run retries the same window.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::instrument;

use super::{EventChannels, EventSenders, Invalidation, Save, TaskHandle, event_channels};
use crate::{
    backends::db_provider::{DbProvider, LAST_UPDATED, QueryParam, StoredRow},
    context::FetchContext,
    fetcher::{DataType, FetchError, FetchErrorKind, StoredJson},
    metrics::{FetchType, MetricsEngine, StoredDataError, StoredDataLabels},
};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DatabaseEventsConfig {
    /// Used as the metrics label of every query.
    pub data_type: DataType,
    pub cache_init_query: String,
    pub cache_init_timeout: Duration,
    pub update_query: String,
    pub update_timeout: Duration,
}

pub struct DatabaseEventProducer {
    config: DatabaseEventsConfig,
    provider: Arc<dyn DbProvider>,
    metrics: Arc<dyn MetricsEngine>,
    clock: Clock,
    senders: EventSenders,
    last_update: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for DatabaseEventProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseEventProducer")
            .field("config", &self.config)
            .field("provider", &self.provider)
            .field("last_update", &self.last_update)
            .finish_non_exhaustive()
    }
}

/// One batch of rows, split into saves and invalidations.
#[derive(Debug, Default)]
struct Batch {
    save: Save,
    invalidation: Invalidation,
}

impl Batch {
    fn from_rows(rows: Vec<StoredRow>, invalidate_empty: bool) -> Result<Self, FetchError> {
        let mut batch = Batch::default();
        for StoredRow { id, data, data_type } in rows {
            let Some(kind) = DataType::from_row_type(&data_type) else {
                tracing::error!(
                    id = id.as_str(),
                    data_type = data_type.as_str(),
                    "Ignoring stored data row with an unknown dataType"
                );
                continue;
            };
            match data.filter(|data| !data.is_empty() && data != "null") {
                Some(data) => {
                    let json = StoredJson::from_json(&data).map_err(|err| {
                        FetchErrorKind::Other(format!("invalid JSON for {kind} {id}: {err}"))
                    })?;
                    let target = match kind {
                        DataType::Request => &mut batch.save.requests,
                        DataType::Imp => &mut batch.save.imps,
                        DataType::Response => &mut batch.save.responses,
                        DataType::Account | DataType::Category => &mut batch.save.accounts,
                    };
                    target.insert(id, json);
                }
                None if invalidate_empty => {
                    let target = match kind {
                        DataType::Request => &mut batch.invalidation.requests,
                        DataType::Imp => &mut batch.invalidation.imps,
                        DataType::Response => &mut batch.invalidation.responses,
                        DataType::Account | DataType::Category => {
                            &mut batch.invalidation.accounts
                        }
                    };
                    target.push(id);
                }
                None => {}
            }
        }
        Ok(batch)
    }
}

impl DatabaseEventProducer {
    pub fn new(
        config: DatabaseEventsConfig,
        provider: Arc<dyn DbProvider>,
        metrics: Arc<dyn MetricsEngine>,
    ) -> (Self, EventChannels) {
        Self::with_clock(config, provider, metrics, Arc::new(Utc::now))
    }

    pub fn with_clock(
        config: DatabaseEventsConfig,
        provider: Arc<dyn DbProvider>,
        metrics: Arc<dyn MetricsEngine>,
        clock: Clock,
    ) -> (Self, EventChannels) {
        let (senders, channels) = event_channels();
        let producer = Self { config, provider, metrics, clock, senders, last_update: None };
        (producer, channels)
    }

    /// The start time of the last successful run, `None` until the first load succeeds.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// Loads everything on the first successful call, the changes since then afterwards.
    pub async fn run(&mut self, ctx: &FetchContext) -> Result<(), FetchError> {
        match self.last_update {
            None => self.fetch_all(ctx).await,
            Some(since) => self.fetch_delta(ctx, since).await,
        }
    }

    #[instrument(skip(self, ctx), fields(data_type = %self.config.data_type))]
    async fn fetch_all(&mut self, ctx: &FetchContext) -> Result<(), FetchError> {
        let started = (self.clock)();
        let ctx = ctx.child_with_timeout(self.config.cache_init_timeout);
        let rows = self
            .query(&ctx, FetchType::All, &self.config.cache_init_query, &[])
            .await?;
        let batch = self.decode(FetchType::All, rows, false)?;
        tracing::info!(
            requests = batch.save.requests.len(),
            imps = batch.save.imps.len(),
            responses = batch.save.responses.len(),
            accounts = batch.save.accounts.len(),
            "Loaded stored data from the database"
        );
        self.senders.save(batch.save);
        self.last_update = Some(started);
        Ok(())
    }

    #[instrument(skip(self, ctx), fields(data_type = %self.config.data_type))]
    async fn fetch_delta(
        &mut self,
        ctx: &FetchContext,
        since: DateTime<Utc>,
    ) -> Result<(), FetchError> {
        let started = (self.clock)();
        let ctx = ctx.child_with_timeout(self.config.update_timeout);
        let params = [(LAST_UPDATED, QueryParam::Timestamp(since))];
        let rows =
            self.query(&ctx, FetchType::Delta, &self.config.update_query, &params).await?;
        let batch = self.decode(FetchType::Delta, rows, true)?;
        tracing::debug!(
            saved = batch.save.requests.len()
                + batch.save.imps.len()
                + batch.save.responses.len()
                + batch.save.accounts.len(),
            invalidated = batch.invalidation.requests.len()
                + batch.invalidation.imps.len()
                + batch.invalidation.responses.len()
                + batch.invalidation.accounts.len(),
            "Polled stored data updates from the database"
        );
        self.senders.save(batch.save);
        self.senders.invalidate(batch.invalidation);
        self.last_update = Some(started);
        Ok(())
    }

    async fn query(
        &self,
        ctx: &FetchContext,
        fetch_type: FetchType,
        template: &str,
        params: &[(&str, QueryParam)],
    ) -> Result<Vec<StoredRow>, FetchError> {
        let labels = StoredDataLabels { data_type: self.config.data_type, fetch_type };
        let start = Instant::now();
        let result = self.provider.query(ctx, template, params).await;
        self.metrics.record_stored_data_fetch_time(labels, start.elapsed());
        result.inspect_err(|err| {
            let kind = match err.is_network() {
                true => StoredDataError::Network,
                false => StoredDataError::Undefined,
            };
            self.metrics.record_stored_data_error(labels, kind);
        })
    }

    fn decode(
        &self,
        fetch_type: FetchType,
        rows: Vec<StoredRow>,
        invalidate_empty: bool,
    ) -> Result<Batch, FetchError> {
        Batch::from_rows(rows, invalidate_empty).inspect_err(|_| {
            let labels = StoredDataLabels { data_type: self.config.data_type, fetch_type };
            self.metrics.record_stored_data_error(labels, StoredDataError::Undefined);
        })
    }
}

/// Runs `producer` now, then every `refresh_rate` until the handle is stopped.
pub fn spawn_polling(mut producer: DatabaseEventProducer, refresh_rate: Duration) -> TaskHandle {
    TaskHandle::spawn(move |stop| async move {
        let ctx = FetchContext::with_cancellation(stop.clone());
        let mut ticker = tokio::time::interval(refresh_rate);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = producer.run(&ctx).await {
                        if ctx.check().is_err() {
                            break;
                        }
                        tracing::error!(
                            data_type = %producer.config.data_type,
                            error = %err,
                            "Failed to poll stored data from the database"
                        );
                    }
                }
            }
        }
        tracing::debug!(data_type = %producer.config.data_type, "Stopped polling the database");
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Mutex;

    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use sqlx::SqlitePool;

    use super::*;
    use crate::{
        backends::db_provider::{DbPool, SqlxDbProvider},
        fetcher::tests::{ids, stored},
        metrics::testing::RecordingMetrics,
    };

    const LOAD_ALL: &str = "SELECT id, data, kind FROM stored ORDER BY id";
    const UPDATE: &str =
        "SELECT id, data, kind FROM stored WHERE updated_at > $LAST_UPDATED ORDER BY id";
    // sqlite compares the RFC 3339 text sqlx binds for timestamps
    const BEFORE: &str = "2024-01-01T00:00:00+00:00";
    const AFTER: &str = "2024-01-01T01:30:00+00:00";

    async fn pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE stored (id TEXT, data TEXT, kind TEXT, updated_at TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    async fn insert(pool: &SqlitePool, id: &str, data: Option<&str>, kind: &str, at: &str) {
        sqlx::query("INSERT INTO stored VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(data)
            .bind(kind)
            .bind(at)
            .execute(pool)
            .await
            .unwrap();
    }

    fn config() -> DatabaseEventsConfig {
        DatabaseEventsConfig {
            data_type: DataType::Request,
            cache_init_query: LOAD_ALL.to_string(),
            cache_init_timeout: Duration::from_secs(5),
            update_query: UPDATE.to_string(),
            update_timeout: Duration::from_secs(5),
        }
    }

    /// A clock returning the queued times in order, then the last one forever.
    fn clock(times: Vec<DateTime<Utc>>) -> Clock {
        let times = Mutex::new(times);
        Arc::new(move || {
            let mut times = times.lock().unwrap();
            if times.len() > 1 { times.remove(0) } else { times[0] }
        })
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    #[stored_requests_macros::tokio_test]
    async fn test_load_all_then_deltas() {
        let pool = pool().await;
        insert(&pool, "r1", Some(r#"{"v":1}"#), "request", BEFORE).await;
        insert(&pool, "i1", Some(r#"{"v":2}"#), "imp", BEFORE).await;
        insert(&pool, "gone", None, "request", BEFORE).await;

        let provider = Arc::new(SqlxDbProvider::new(DbPool::Sqlite(pool.clone())));
        let metrics = Arc::new(RecordingMetrics::default());
        let (mut producer, mut channels) = DatabaseEventProducer::with_clock(
            config(),
            provider,
            metrics.clone(),
            clock(vec![at(1), at(2)]),
        );
        let ctx = FetchContext::background();

        producer.run(&ctx).await.unwrap();
        let save = channels.saves.try_recv().unwrap();
        assert_eq!(save.requests, stored(&[("r1", r#"{"v":1}"#)]));
        assert_eq!(save.imps, stored(&[("i1", r#"{"v":2}"#)]));
        assert!(channels.invalidations.try_recv().is_err());
        assert_eq!(producer.last_update(), Some(at(1)));

        insert(&pool, "r2", Some(r#"{"v":3}"#), "request", AFTER).await;
        insert(&pool, "i2", Some(""), "imp", AFTER).await;
        producer.run(&ctx).await.unwrap();
        let save = channels.saves.try_recv().unwrap();
        assert_eq!(save.requests, stored(&[("r2", r#"{"v":3}"#)]));
        let invalidation = channels.invalidations.try_recv().unwrap();
        assert_eq!(invalidation.imps, ids(&["i2"]));
        assert_eq!(producer.last_update(), Some(at(2)));

        let fetch_types: Vec<_> = metrics.fetch_times().iter().map(|l| l.fetch_type).collect();
        assert_eq!(fetch_types, vec![FetchType::All, FetchType::Delta]);
        assert!(metrics.errors().is_empty());
    }

    #[stored_requests_macros::tokio_test]
    async fn test_failed_delta_keeps_watermark() {
        let pool = pool().await;
        insert(&pool, "r1", Some("{}"), "request", BEFORE).await;
        let provider = Arc::new(SqlxDbProvider::new(DbPool::Sqlite(pool.clone())));
        let metrics = Arc::new(RecordingMetrics::default());
        let (mut producer, mut channels) = DatabaseEventProducer::with_clock(
            config(),
            provider,
            metrics.clone(),
            clock(vec![at(1), at(2), at(3)]),
        );
        let ctx = FetchContext::background();
        producer.run(&ctx).await.unwrap();
        channels.saves.try_recv().unwrap();

        insert(&pool, "ok", Some("{}"), "request", AFTER).await;
        insert(&pool, "bad", Some("{not json"), "request", AFTER).await;
        assert!(producer.run(&ctx).await.is_err());
        assert!(channels.saves.try_recv().is_err());
        assert_eq!(producer.last_update(), Some(at(1)));
        assert_eq!(
            metrics.errors(),
            vec![(
                StoredDataLabels { data_type: DataType::Request, fetch_type: FetchType::Delta },
                StoredDataError::Undefined
            )]
        );
    }

    #[stored_requests_macros::tokio_test]
    async fn test_failed_load_is_retried() {
        let pool = pool().await;
        let provider = Arc::new(SqlxDbProvider::new(DbPool::Sqlite(pool.clone())));
        let mut config = config();
        config.cache_init_query = "SELECT id, data, kind FROM missing_table".to_string();
        let (mut producer, _channels) =
            DatabaseEventProducer::new(config, provider, Arc::new(RecordingMetrics::default()));
        let ctx = FetchContext::background();
        assert!(producer.run(&ctx).await.is_err());
        assert!(producer.run(&ctx).await.is_err());
        assert_eq!(producer.last_update(), None);
    }

    #[test]
    fn test_unknown_data_types_are_skipped() {
        let rows = vec![
            StoredRow {
                id: "v".to_string(),
                data: Some("{}".to_string()),
                data_type: "video".to_string(),
            },
            StoredRow {
                id: "acc".to_string(),
                data: Some("null".to_string()),
                data_type: "account".to_string(),
            },
        ];
        let batch = Batch::from_rows(rows.clone(), false).unwrap();
        assert!(batch.save.is_empty());
        assert!(batch.invalidation.is_empty());
        let batch = Batch::from_rows(rows, true).unwrap();
        assert_eq!(batch.invalidation.accounts, ids(&["acc"]));
    }

    #[stored_requests_macros::tokio_test]
    async fn test_polling_runs_immediately_and_stops() {
        let pool = pool().await;
        insert(&pool, "r1", Some("{}"), "request", BEFORE).await;
        let provider = Arc::new(SqlxDbProvider::new(DbPool::Sqlite(pool)));
        let (producer, mut channels) =
            DatabaseEventProducer::new(config(), provider, Arc::new(RecordingMetrics::default()));
        let handle = spawn_polling(producer, Duration::from_secs(3600));
        let save = tokio::time::timeout(Duration::from_secs(5), channels.saves.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(save.requests.len(), 1);
        handle.shutdown().await;
        assert!(handle.is_stopped());
    }
}
