//! Database boundary: pool setup and the row source the exporter reads from.
//!
//! The exporter only sees [`RelationSource`]; `SqlxSource` is the production
//! implementation over one of sqlx's concrete drivers (postgres, mysql,
//! sqlite), chosen by the connection URL scheme.
//!
//! Queries go out without bind parameters, so postgres and mysql answer in
//! their text protocols and every cell arrives as the server's textual
//! rendering. Cells are never decoded by column type.

use crate::config::{ConfigError, DbConfig};
use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::pool::PoolOptions;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Column, ColumnIndex, Connection, Database, Decode, Executor, Row, ValueRef};
use thiserror::Error;
use tracing::{error, info, instrument};

const MAX_OPEN_CONNECTIONS: u32 = 25;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("invalid database settings: {0}")]
    Config(#[from] ConfigError),
    #[error("unsupported database url scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("column {column} holds a value that cannot be rendered as text")]
    Unrenderable { column: String },
    #[error("{0}")]
    Source(String),
}

/// Connection pool for whichever driver the configuration names.
#[derive(Debug, Clone)]
pub enum Pool {
    Postgres(PgPool),
    MySql(MySqlPool),
    Sqlite(SqlitePool),
}

impl Pool {
    pub async fn close(&self) {
        match self {
            Pool::Postgres(p) => p.close().await,
            Pool::MySql(p) => p.close().await,
            Pool::Sqlite(p) => p.close().await,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Pool::Postgres(p) => p.is_closed(),
            Pool::MySql(p) => p.is_closed(),
            Pool::Sqlite(p) => p.is_closed(),
        }
    }
}

impl From<PgPool> for Pool {
    fn from(pool: PgPool) -> Self {
        Pool::Postgres(pool)
    }
}

impl From<MySqlPool> for Pool {
    fn from(pool: MySqlPool) -> Self {
        Pool::MySql(pool)
    }
}

impl From<SqlitePool> for Pool {
    fn from(pool: SqlitePool) -> Self {
        Pool::Sqlite(pool)
    }
}

/// A fully read result set. `None` cells are SQL NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

/// Anything that can run a query and hand back rows of textual cells.
#[async_trait]
pub trait RelationSource: Send + Sync {
    async fn query_rows(&self, sql: &str) -> Result<RelationRows, DbError>;
}

/// Open the pool described by `cfg` and verify it with a ping.
#[instrument(skip_all, fields(driver = %cfg.driver, host = %cfg.host, port = cfg.port))]
pub async fn connect(cfg: &DbConfig) -> Result<Pool, DbError> {
    info!("connecting to database");
    let url = cfg.connection_url()?;
    init_pool(&url).await
}

/// Open a pool for a driver URL. Connections never expire by age.
pub async fn init_pool(database_url: &str) -> Result<Pool, DbError> {
    let scheme = database_url.split(':').next().unwrap_or_default();
    let opened: Result<Pool, sqlx::Error> = match scheme {
        "postgres" | "postgresql" => open(PgPoolOptions::new(), database_url).await.map(Pool::from),
        "mysql" | "mariadb" => open(MySqlPoolOptions::new(), database_url).await.map(Pool::from),
        "sqlite" => open(SqlitePoolOptions::new(), database_url).await.map(Pool::from),
        other => return Err(DbError::UnsupportedScheme(other.to_string())),
    };
    let pool = opened.map_err(|err| {
        error!(%err, "failed to open database connection");
        err
    })?;

    let pinged = match &pool {
        Pool::Postgres(p) => ping(p).await,
        Pool::MySql(p) => ping(p).await,
        Pool::Sqlite(p) => ping(p).await,
    };
    if let Err(err) = pinged {
        error!(%err, "failed to ping database");
        pool.close().await;
        return Err(err.into());
    }

    info!("database connection established");
    Ok(pool)
}

async fn open<DB: Database>(options: PoolOptions<DB>, url: &str) -> Result<sqlx::Pool<DB>, sqlx::Error> {
    options
        .max_connections(MAX_OPEN_CONNECTIONS)
        .max_lifetime(None)
        .connect(url)
        .await
}

async fn ping<DB: Database>(pool: &sqlx::Pool<DB>) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    conn.ping().await
}

/// [`RelationSource`] backed by an sqlx pool. Does not close the pool.
#[derive(Debug, Clone)]
pub struct SqlxSource {
    pool: Pool,
}

impl SqlxSource {
    pub fn new(pool: impl Into<Pool>) -> Self {
        Self { pool: pool.into() }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl RelationSource for SqlxSource {
    async fn query_rows(&self, sql: &str) -> Result<RelationRows, DbError> {
        match &self.pool {
            Pool::Postgres(p) => read_relation(p, sql).await,
            Pool::MySql(p) => read_relation(p, sql).await,
            Pool::Sqlite(p) => read_relation(p, sql).await,
        }
    }
}

async fn read_relation<DB>(pool: &sqlx::Pool<DB>, sql: &str) -> Result<RelationRows, DbError>
where
    DB: Database,
    for<'c> &'c mut DB::Connection: Executor<'c, Database = DB>,
    for<'r> String: Decode<'r, DB>,
    for<'r> Vec<u8>: Decode<'r, DB>,
    usize: ColumnIndex<DB::Row>,
{
    // a plain &str carries no arguments and is sent unprepared
    let fetched = pool.fetch_all(sql).await?;

    let mut out = RelationRows::default();
    if let Some(first) = fetched.first() {
        out.columns = first.columns().iter().map(|c| c.name().to_string()).collect();
    } else {
        // Empty result: column names still come from the statement metadata.
        let described = pool.describe(sql).await?;
        out.columns = described.columns().iter().map(|c| c.name().to_string()).collect();
    }

    for row in &fetched {
        let cells = (0..row.len())
            .map(|idx| render_cell(row, idx))
            .collect::<Result<Vec<_>, _>>()?;
        out.rows.push(cells);
    }
    Ok(out)
}

/// Textual rendering of one cell, read as the bytes the driver received and
/// never checked against the column type. `None` for SQL NULL.
fn render_cell<R>(row: &R, idx: usize) -> Result<Option<String>, DbError>
where
    R: Row,
    for<'r> String: Decode<'r, R::Database>,
    for<'r> Vec<u8>: Decode<'r, R::Database>,
    usize: ColumnIndex<R>,
{
    if row.try_get_raw(idx)?.is_null() {
        return Ok(None);
    }
    if let Ok(text) = row.try_get_unchecked::<String, _>(idx) {
        return Ok(Some(text));
    }
    if let Ok(bytes) = row.try_get_unchecked::<Vec<u8>, _>(idx) {
        return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
    }
    Err(DbError::Unrenderable {
        column: row.column(idx).name().to_string(),
    })
}
