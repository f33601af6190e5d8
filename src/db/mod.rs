//! Postgres connection and query management.
//!
//! One pooled handle per logical connection name, liveness-probed before
//! use and transparently replaced when dead. Statements run through
//! dynamic parameter binding; reads can opt into an in-process memo, and
//! writes participate in nesting-counter transactions: one real database
//! transaction per outermost begin/commit pair, rollback at any depth
//! aborting the whole unit of work.

mod memo;
mod params;
mod stats;

pub use params::SqlParam;
pub use stats::{QueryLog, QueryStat, StatementKind};

use std::collections::HashMap;
use std::time::Instant;

use metrics::{counter, histogram};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{FromRow, Postgres, Transaction};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::DatabaseSettings;

use memo::QueryMemo;
use params::{bind_query, bind_query_as, statement_key};

/// Name of the logical connection the facade and transactions run on.
pub const DEFAULT_CONNECTION: &str = "default";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("no database url configured")]
    MissingUrl,
    #[error("database connection failed: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("query failed: {message}")]
    Query { message: String },
    #[error("resource not found")]
    NotFound,
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("statement timed out")]
    Timeout,
    #[error("no transaction in progress")]
    NoTransaction,
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("result decoding failed: {0}")]
    Decode(#[from] serde_json::Error),
}

pub(crate) fn map_sqlx_error(err: sqlx::Error) -> DbError {
    match err {
        sqlx::Error::RowNotFound => DbError::NotFound,
        sqlx::Error::PoolTimedOut => DbError::Timeout,
        sqlx::Error::Database(db) if db.message().contains("duplicate key") => DbError::Duplicate {
            constraint: db.constraint().unwrap_or("unknown").to_string(),
        },
        sqlx::Error::Database(db)
            if db
                .message()
                .contains("canceling statement due to user request") =>
        {
            DbError::Timeout
        }
        other => DbError::Query {
            message: other.to_string(),
        },
    }
}

/// Per-statement execution options.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    /// Memoize the deserialized rows in-process, keyed by statement hash.
    pub cache: bool,
}

impl QueryOptions {
    pub fn cached() -> Self {
        Self { cache: true }
    }
}

/// Nesting counter: one real transaction per outermost begin/commit pair.
#[derive(Debug, Default)]
struct TxDepth(u32);

impl TxDepth {
    /// Returns true when this begin must open the real transaction.
    fn open(&mut self) -> bool {
        self.0 += 1;
        self.0 == 1
    }

    /// Returns true when this commit must issue the real commit.
    fn close(&mut self) -> Result<bool, DbError> {
        if self.0 == 0 {
            return Err(DbError::NoTransaction);
        }
        self.0 -= 1;
        Ok(self.0 == 0)
    }

    /// Rollback at any depth aborts the whole unit of work.
    fn reset(&mut self) -> Result<(), DbError> {
        if self.0 == 0 {
            return Err(DbError::NoTransaction);
        }
        self.0 = 0;
        Ok(())
    }

    fn depth(&self) -> u32 {
        self.0
    }
}

#[derive(Default)]
struct TxState {
    depth: TxDepth,
    tx: Option<Transaction<'static, Postgres>>,
}

/// Pooled Postgres access with memoized reads and counted transactions.
pub struct DatabaseManager {
    settings: DatabaseSettings,
    pools: RwLock<HashMap<String, PgPool>>,
    tx: Mutex<TxState>,
    memo: QueryMemo,
    log: QueryLog,
}

impl DatabaseManager {
    /// Connect the default logical connection eagerly and verify it.
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, DbError> {
        let manager = Self {
            settings: settings.clone(),
            pools: RwLock::new(HashMap::new()),
            tx: Mutex::new(TxState::default()),
            memo: QueryMemo::new(settings.memo_capacity),
            log: QueryLog::default(),
        };
        manager.pool(DEFAULT_CONNECTION).await?;
        Ok(manager)
    }

    /// Live pool for a logical connection name.
    ///
    /// An existing handle is probed with `SELECT 1` first; a dead one is
    /// closed and transparently recreated. Unknown names fall back to the
    /// default connection url.
    pub async fn pool(&self, name: &str) -> Result<PgPool, DbError> {
        let existing = self.pools.read().await.get(name).cloned();
        if let Some(pool) = existing {
            match sqlx::query("SELECT 1").execute(&pool).await {
                Ok(_) => return Ok(pool),
                Err(err) => {
                    warn!(connection = name, %err, "liveness probe failed, replacing pool");
                    pool.close().await;
                    self.pools.write().await.remove(name);
                }
            }
        }

        let pool = self.open_pool(name).await?;
        self.pools
            .write()
            .await
            .insert(name.to_string(), pool.clone());
        Ok(pool)
    }

    /// Close every pooled handle.
    pub async fn close_all(&self) {
        let mut pools = self.pools.write().await;
        for (_, pool) in pools.drain() {
            pool.close().await;
        }
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        let pool = self.pool(DEFAULT_CONNECTION).await?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map(|_| ())
            .map_err(map_sqlx_error)
    }

    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let pool = self.pool(DEFAULT_CONNECTION).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::from)
    }

    /// Execute a read statement and map every row.
    ///
    /// With `QueryOptions::cached()` the deserialized rows are memoized for
    /// the process lifetime; a later identical statement is served without
    /// touching the database.
    pub async fn fetch_all<T>(
        &self,
        sql: &str,
        params: &[SqlParam],
        options: QueryOptions,
    ) -> Result<Vec<T>, DbError>
    where
        T: for<'r> FromRow<'r, PgRow> + Serialize + DeserializeOwned + Send + Unpin,
    {
        let key = statement_key(sql, params);
        if options.cache
            && let Some(value) = self.memo.get(key)
        {
            counter!("vetrina_db_memo_hit_total").increment(1);
            self.log.record(StatementKind::MemoHit, sql, 0.0, None);
            return Ok(serde_json::from_value((*value).clone())?);
        }

        let started = Instant::now();
        let result = self.run_fetch::<T>(sql, params).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!("vetrina_db_statement_ms").record(elapsed_ms);

        match result {
            Ok(rows) => {
                counter!("vetrina_db_query_total").increment(1);
                self.log.record(StatementKind::Executed, sql, elapsed_ms, None);
                if options.cache {
                    match serde_json::to_value(&rows) {
                        Ok(value) => self.memo.put(key, value),
                        Err(err) => warn!(%err, "query result is not memoizable, skipping"),
                    }
                }
                Ok(rows)
            }
            Err(err) => {
                counter!("vetrina_db_error_total").increment(1);
                self.log
                    .record(StatementKind::Error, sql, elapsed_ms, Some(err.to_string()));
                Err(err)
            }
        }
    }

    pub async fn fetch_optional<T>(
        &self,
        sql: &str,
        params: &[SqlParam],
        options: QueryOptions,
    ) -> Result<Option<T>, DbError>
    where
        T: for<'r> FromRow<'r, PgRow> + Serialize + DeserializeOwned + Send + Unpin,
    {
        Ok(self.fetch_all(sql, params, options).await?.into_iter().next())
    }

    pub async fn fetch_one<T>(
        &self,
        sql: &str,
        params: &[SqlParam],
        options: QueryOptions,
    ) -> Result<T, DbError>
    where
        T: for<'r> FromRow<'r, PgRow> + Serialize + DeserializeOwned + Send + Unpin,
    {
        self.fetch_optional(sql, params, options)
            .await?
            .ok_or(DbError::NotFound)
    }

    /// Execute a write statement, returning the affected-row count.
    pub async fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64, DbError> {
        let started = Instant::now();
        let result = self.run_execute(sql, params).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!("vetrina_db_statement_ms").record(elapsed_ms);

        match result {
            Ok(affected) => {
                counter!("vetrina_db_query_total").increment(1);
                self.log.record(StatementKind::Executed, sql, elapsed_ms, None);
                Ok(affected)
            }
            Err(err) => {
                counter!("vetrina_db_error_total").increment(1);
                self.log
                    .record(StatementKind::Error, sql, elapsed_ms, Some(err.to_string()));
                Err(err)
            }
        }
    }

    /// Open a transaction, or deepen the current one.
    pub async fn begin(&self) -> Result<(), DbError> {
        let mut guard = self.tx.lock().await;
        if guard.depth.open() {
            let pool = self.pool(DEFAULT_CONNECTION).await?;
            match pool.begin().await {
                Ok(tx) => guard.tx = Some(tx),
                Err(err) => {
                    guard.depth = TxDepth::default();
                    return Err(map_sqlx_error(err));
                }
            }
        }
        debug!(depth = guard.depth.depth(), "transaction begin");
        Ok(())
    }

    /// Close one nesting level; the outermost close issues the real commit.
    pub async fn commit(&self) -> Result<(), DbError> {
        let mut guard = self.tx.lock().await;
        if guard.depth.close()?
            && let Some(tx) = guard.tx.take()
        {
            tx.commit().await.map_err(map_sqlx_error)?;
        }
        debug!(depth = guard.depth.depth(), "transaction commit");
        Ok(())
    }

    /// Abort the whole unit of work from any nesting depth.
    pub async fn rollback(&self) -> Result<(), DbError> {
        let mut guard = self.tx.lock().await;
        guard.depth.reset()?;
        if let Some(tx) = guard.tx.take() {
            tx.rollback().await.map_err(map_sqlx_error)?;
        }
        debug!("transaction rolled back");
        Ok(())
    }

    /// Wrap a unit of work in begin/commit, forcing rollback on error.
    pub async fn transaction<T, F>(&self, work: F) -> Result<T, DbError>
    where
        F: AsyncFnOnce(&Self) -> Result<T, DbError>,
    {
        self.begin().await?;
        match work(self).await {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback().await {
                    warn!(%rollback_err, "rollback failed after transaction error");
                }
                Err(err)
            }
        }
    }

    /// Current nesting depth; zero when no transaction is open.
    pub async fn transaction_depth(&self) -> u32 {
        self.tx.lock().await.depth.depth()
    }

    pub fn log(&self) -> &QueryLog {
        &self.log
    }

    /// Number of memoized statements, for reporting.
    pub fn memo_len(&self) -> usize {
        self.memo.len()
    }

    async fn open_pool(&self, name: &str) -> Result<PgPool, DbError> {
        let url = match name {
            DEFAULT_CONNECTION => self.settings.url.as_deref(),
            other => self
                .settings
                .named
                .get(other)
                .map(String::as_str)
                .or(self.settings.url.as_deref()),
        }
        .ok_or(DbError::MissingUrl)?;

        PgPoolOptions::new()
            .max_connections(self.settings.max_connections.get())
            .acquire_timeout(self.settings.acquire_timeout)
            .connect(url)
            .await
            .map_err(DbError::Connect)
    }

    async fn run_fetch<T>(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<T>, DbError>
    where
        T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        let mut guard = self.tx.lock().await;
        if let Some(tx) = guard.tx.as_mut() {
            return bind_query_as::<T>(sql, params)
                .fetch_all(&mut **tx)
                .await
                .map_err(map_sqlx_error);
        }
        drop(guard);

        let pool = self.pool(DEFAULT_CONNECTION).await?;
        bind_query_as::<T>(sql, params)
            .fetch_all(&pool)
            .await
            .map_err(map_sqlx_error)
    }

    async fn run_execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64, DbError> {
        let mut guard = self.tx.lock().await;
        if let Some(tx) = guard.tx.as_mut() {
            return bind_query(sql, params)
                .execute(&mut **tx)
                .await
                .map(|done| done.rows_affected())
                .map_err(map_sqlx_error);
        }
        drop(guard);

        let pool = self.pool(DEFAULT_CONNECTION).await?;
        bind_query(sql, params)
            .execute(&pool)
            .await
            .map(|done| done.rows_affected())
            .map_err(map_sqlx_error)
    }
}
