//! SQL connectivity shared by the database fetcher and the database event producer.
//!
//! Queries are templates with named placeholders such as `$REQUEST_ID_LIST` or
//! `$LAST_UPDATED`. [`prepare_query`] turns a template into driver SQL plus the
//! arguments to bind, in placeholder order. An ID list expands into a parenthesized
//! list with one placeholder per ID, so templates are written `WHERE id IN $ID_LIST`.

use std::{
    fmt,
    sync::{Arc, LazyLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sqlx::{
    ColumnIndex, Decode, MySqlPool, PgPool, Row, SqlitePool, Type, mysql::MySqlPoolOptions,
    postgres::PgPoolOptions, sqlite::SqlitePoolOptions, types::Json,
};

use crate::{context::FetchContext, fetcher::FetchError};

pub const REQUEST_ID_LIST: &str = "REQUEST_ID_LIST";
pub const IMP_ID_LIST: &str = "IMP_ID_LIST";
pub const ID_LIST: &str = "ID_LIST";
pub const LAST_UPDATED: &str = "LAST_UPDATED";

#[allow(clippy::expect_used)] // the pattern is a constant
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").expect("invalid placeholder pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbDriver {
    Postgres,
    #[serde(rename = "mysql")]
    MySql,
    Sqlite,
}

impl DbDriver {
    pub fn placeholder_style(&self) -> PlaceholderStyle {
        match self {
            DbDriver::Postgres => PlaceholderStyle::Numbered,
            DbDriver::MySql | DbDriver::Sqlite => PlaceholderStyle::QuestionMark,
        }
    }
}

/// How bound parameters are written in driver SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?`, arguments bound in order of appearance.
    QuestionMark,
    /// `$1`, `$2`, ...
    Numbered,
}

/// A value substituted for a named placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    IdList(Vec<String>),
    Timestamp(DateTime<Utc>),
}

/// A value to bind, in the order of the placeholders of the prepared SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryArg {
    Text(String),
    Timestamp(DateTime<Utc>),
}

/// Renders `template` for a driver.
///
/// `params` are looked up by name, without the leading `$`. Placeholders with no
/// matching parameter are left untouched. An empty ID list renders as `(NULL)`, which
/// keeps `IN` clauses valid and matches nothing.
pub fn prepare_query(
    template: &str,
    params: &[(&str, QueryParam)],
    style: PlaceholderStyle,
) -> (String, Vec<QueryArg>) {
    let mut args = Vec::new();
    let next_placeholder = |args: &mut Vec<QueryArg>, arg: QueryArg| {
        args.push(arg);
        match style {
            PlaceholderStyle::QuestionMark => "?".to_string(),
            PlaceholderStyle::Numbered => format!("${}", args.len()),
        }
    };
    let sql = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        let name = &caps[1];
        match params.iter().find(|(param, _)| *param == name).map(|(_, value)| value) {
            Some(QueryParam::IdList(ids)) if ids.is_empty() => "(NULL)".to_string(),
            Some(QueryParam::IdList(ids)) => {
                let placeholders: Vec<String> = ids
                    .iter()
                    .map(|id| next_placeholder(&mut args, QueryArg::Text(id.clone())))
                    .collect();
                format!("({})", placeholders.join(", "))
            }
            Some(QueryParam::Timestamp(ts)) => {
                next_placeholder(&mut args, QueryArg::Timestamp(*ts))
            }
            None => caps[0].to_string(),
        }
    });
    (sql.into_owned(), args)
}

/// One row of a stored data query: `(id, data, dataType)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub id: String,
    pub data: Option<String>,
    pub data_type: String,
}

/// Runs stored data queries against one database.
#[async_trait]
pub trait DbProvider: fmt::Debug + Send + Sync {
    fn driver(&self) -> DbDriver;

    /// Prepares `template` with `params` and returns every row. A row that can't be
    /// decoded fails the whole query.
    async fn query(
        &self,
        ctx: &FetchContext,
        template: &str,
        params: &[(&str, QueryParam)],
    ) -> Result<Vec<StoredRow>, FetchError>;

    async fn close(&self);
}

#[derive(Debug, Clone)]
pub enum DbPool {
    Postgres(PgPool),
    MySql(MySqlPool),
    Sqlite(SqlitePool),
}

/// [`DbProvider`] over a `sqlx` connection pool.
#[derive(Debug, Clone)]
pub struct SqlxDbProvider {
    pool: DbPool,
}

impl SqlxDbProvider {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn connect(
        driver: DbDriver,
        url: &str,
        max_connections: u32,
    ) -> Result<Self, FetchError> {
        let pool = match driver {
            DbDriver::Postgres => DbPool::Postgres(
                PgPoolOptions::new().max_connections(max_connections).connect(url).await?,
            ),
            DbDriver::MySql => DbPool::MySql(
                MySqlPoolOptions::new().max_connections(max_connections).connect(url).await?,
            ),
            DbDriver::Sqlite => DbPool::Sqlite(
                SqlitePoolOptions::new().max_connections(max_connections).connect(url).await?,
            ),
        };
        tracing::info!(?driver, max_connections, "Connected to the stored data database");
        Ok(Self { pool })
    }

    pub fn into_shared(self) -> Arc<dyn DbProvider> {
        Arc::new(self)
    }
}

fn scan_row<R: Row>(row: &R) -> Result<StoredRow, sqlx::Error>
where
    usize: ColumnIndex<R>,
    for<'r> String: Decode<'r, R::Database> + Type<R::Database>,
    for<'r> Json<Box<RawValue>>: Decode<'r, R::Database> + Type<R::Database>,
    for<'r> Vec<u8>: Decode<'r, R::Database> + Type<R::Database>,
{
    Ok(StoredRow { id: row.try_get(0)?, data: scan_data(row)?, data_type: row.try_get(2)? })
}

/// Reads the data column as text, falling back to JSON (`json`, `jsonb`) and binary
/// (`bytea`, `blob`) column types.
fn scan_data<R: Row>(row: &R) -> Result<Option<String>, sqlx::Error>
where
    usize: ColumnIndex<R>,
    for<'r> String: Decode<'r, R::Database> + Type<R::Database>,
    for<'r> Json<Box<RawValue>>: Decode<'r, R::Database> + Type<R::Database>,
    for<'r> Vec<u8>: Decode<'r, R::Database> + Type<R::Database>,
{
    match row.try_get::<Option<String>, _>(1) {
        Err(sqlx::Error::ColumnDecode { .. }) => {}
        other => return other,
    }
    match row.try_get::<Option<Json<Box<RawValue>>>, _>(1) {
        Ok(json) => return Ok(json.map(|Json(raw)| raw.get().to_string())),
        Err(sqlx::Error::ColumnDecode { .. }) => {}
        Err(err) => return Err(err),
    }
    row.try_get::<Option<Vec<u8>>, _>(1)?
        .map(|bytes| String::from_utf8(bytes).map_err(|err| sqlx::Error::Decode(Box::new(err))))
        .transpose()
}

macro_rules! run_query {
    ($ctx:expr, $pool:expr, $sql:expr, $args:expr) => {{
        let mut query = sqlx::query($sql);
        for arg in $args {
            query = match arg {
                QueryArg::Text(value) => query.bind(value),
                QueryArg::Timestamp(value) => query.bind(value),
            };
        }
        let rows = $ctx.run(query.fetch_all($pool)).await??;
        rows.iter().map(scan_row).collect::<Result<Vec<_>, _>>()?
    }};
}

#[async_trait]
impl DbProvider for SqlxDbProvider {
    fn driver(&self) -> DbDriver {
        match self.pool {
            DbPool::Postgres(_) => DbDriver::Postgres,
            DbPool::MySql(_) => DbDriver::MySql,
            DbPool::Sqlite(_) => DbDriver::Sqlite,
        }
    }

    async fn query(
        &self,
        ctx: &FetchContext,
        template: &str,
        params: &[(&str, QueryParam)],
    ) -> Result<Vec<StoredRow>, FetchError> {
        let (sql, args) = prepare_query(template, params, self.driver().placeholder_style());
        tracing::trace!(sql = sql.as_str(), args = args.len(), "Querying stored data");
        let rows = match &self.pool {
            DbPool::Postgres(pool) => run_query!(ctx, pool, &sql, args),
            DbPool::MySql(pool) => run_query!(ctx, pool, &sql, args),
            DbPool::Sqlite(pool) => run_query!(ctx, pool, &sql, args),
        };
        Ok(rows)
    }

    async fn close(&self) {
        match &self.pool {
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::MySql(pool) => pool.close().await,
            DbPool::Sqlite(pool) => pool.close().await,
        }
    }
}
