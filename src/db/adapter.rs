//! Uniform adapter over a driver and its pool.
//!
//! [`SqlAdapter`] implements the capability set every dialect shares: lifecycle,
//! queries, transactions, health probing and pool statistics. Dialect-specific behaviour
//! lives entirely in the [`Driver`].

use crate::config::DatabaseConfig;
use crate::db::database_pool::PoolRegistry;
use crate::db::driver::{Driver, Executor, Session};
use crate::db::macros::dispatch_adapter;
#[cfg(feature = "mssql")]
use crate::db::mssql::MssqlDriver;
use crate::db::mysql::MySqlDriver;
use crate::db::pool::{ConnectionPool, ErrorHandler, PoolConfig, PoolStats, PooledConnection};
use crate::db::postgres::{PgDriver, PostgresAdapter, PostgresAdapterConfig};
use crate::db::sqlite::SqliteDriver;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseDriver, PlaceholderStyle, QueryParam, Row};
use futures_util::future::BoxFuture;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

/// Adapter for one pool key of one dialect.
pub struct SqlAdapter<D: Driver> {
    driver: Arc<D>,
    pool_key: String,
    config: PoolConfig,
    registry: Arc<PoolRegistry<D>>,
    /// Uses std::sync::RwLock so `pool()` stays synchronous.
    pool: RwLock<Option<Arc<ConnectionPool<D>>>>,
    error_handler: RwLock<Option<ErrorHandler>>,
    /// Serializes connect/disconnect so a pool is attached at most once per adapter.
    lifecycle: TokioMutex<()>,
}

impl<D: Driver> SqlAdapter<D> {
    /// Create an adapter whose pool lives in `registry` under `pool_key`.
    pub fn new(
        driver: D,
        pool_key: impl Into<String>,
        config: PoolConfig,
        registry: Arc<PoolRegistry<D>>,
    ) -> Self {
        Self {
            driver: Arc::new(driver),
            pool_key: pool_key.into(),
            config,
            registry,
            pool: RwLock::new(None),
            error_handler: RwLock::new(None),
            lifecycle: TokioMutex::new(()),
        }
    }

    /// Create an adapter with a private pool registry.
    pub fn standalone(driver: D, pool_key: impl Into<String>, config: PoolConfig) -> Self {
        Self::new(driver, pool_key, config, PoolRegistry::new())
    }

    pub fn pool_key(&self) -> &str {
        &self.pool_key
    }

    pub fn pool_config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn dialect(&self) -> DatabaseDriver {
        self.driver.dialect()
    }

    pub fn placeholder_style(&self) -> PlaceholderStyle {
        self.driver.placeholder_style()
    }

    /// Handler for background pool failures, applied when this adapter creates its pool.
    pub fn set_error_handler(&self, handler: ErrorHandler) {
        if let Ok(pool) = self.pool() {
            pool.set_error_handler(Arc::clone(&handler));
        }
        *self
            .error_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Attach to the pool for this adapter's key, creating it if needed, and pre-open
    /// `min_connections`. Calling it again while connected does nothing.
    pub async fn connect(&self) -> DbResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            info!(pool_key = %self.pool_key, "Already connected, reusing existing pool");
            return Ok(());
        }

        self.config.validate()?;
        let (pool, created) =
            self.registry
                .attach(&self.pool_key, &self.config, Arc::clone(&self.driver));
        if created {
            let handler = self
                .error_handler
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(handler) = handler {
                pool.set_error_handler(handler);
            }
        } else {
            info!(pool_key = %self.pool_key, "Reusing existing pool");
        }

        if let Err(e) = pool.warm().await {
            self.registry.detach(&self.pool_key).await;
            return Err(e);
        }

        *self.pool.write().unwrap_or_else(PoisonError::into_inner) = Some(pool);
        info!(
            pool_key = %self.pool_key,
            dialect = %self.dialect(),
            "Connected"
        );
        Ok(())
    }

    /// Detach from the pool. The pool is drained once no adapter uses it.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let pool = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if pool.is_some() {
            self.registry.detach(&self.pool_key).await;
            info!(pool_key = %self.pool_key, "Disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The connected pool, or [`DbError::NotConnected`].
    pub fn pool(&self) -> DbResult<Arc<ConnectionPool<D>>> {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| DbError::not_connected(&self.pool_key))
    }

    pub async fn acquire(&self) -> DbResult<PooledConnection<D>> {
        self.pool()?.acquire().await
    }

    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        let mut conn = self.acquire().await?;
        debug!(pool_key = %self.pool_key, sql = %sql, params = params.len(), "Executing query");

        conn.set_discard_on_drop(true);
        let result = self.driver.fetch_all(&mut conn, sql, params).await;
        Self::finish(conn, result.as_ref().err());
        result
    }

    pub async fn query_one(&self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Run a statement and return the affected row count, 0 when the backend reports none.
    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let mut conn = self.acquire().await?;
        debug!(pool_key = %self.pool_key, sql = %sql, params = params.len(), "Executing statement");

        conn.set_discard_on_drop(true);
        let result = self.driver.execute(&mut conn, sql, params).await;
        Self::finish(conn, result.as_ref().err());
        Ok(result?.unwrap_or(0))
    }

    /// Run `body` inside a transaction on one pooled connection.
    ///
    /// Commits when the body succeeds. When it fails the transaction is rolled back and
    /// the body's error is returned unchanged. The connection goes back to the pool exactly
    /// once; if the body panics or the future is dropped mid-transaction it is discarded
    /// instead.
    pub async fn transaction<T, F>(&self, body: F) -> DbResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut dyn Executor) -> BoxFuture<'t, DbResult<T>> + Send,
    {
        let mut conn = self.acquire().await?;
        conn.set_discard_on_drop(true);

        if let Err(e) = self
            .driver
            .execute_raw(&mut conn, self.driver.begin_statement())
            .await
        {
            Self::finish(conn, Some(&e));
            return Err(DbError::transaction(format!("Failed to begin: {}", e)));
        }
        debug!(pool_key = %self.pool_key, "Transaction started");

        let outcome = {
            let mut session = Session::new(&*self.driver, &mut *conn);
            body(&mut session).await
        };

        match outcome {
            Ok(value) => {
                match self
                    .driver
                    .execute_raw(&mut conn, self.driver.commit_statement())
                    .await
                {
                    Ok(()) => {
                        debug!(pool_key = %self.pool_key, "Transaction committed");
                        conn.release();
                        Ok(value)
                    }
                    Err(e) => {
                        warn!(pool_key = %self.pool_key, error = %e, "Commit failed");
                        self.rollback_and_finish(conn).await;
                        Err(DbError::transaction(format!("Failed to commit: {}", e)))
                    }
                }
            }
            Err(e) => {
                debug!(pool_key = %self.pool_key, error = %e, "Transaction body failed, rolling back");
                if e.is_connection_fatal() {
                    conn.discard();
                } else {
                    self.rollback_and_finish(conn).await;
                }
                Err(e)
            }
        }
    }

    /// Issue ROLLBACK and return the connection; discard it when ROLLBACK fails.
    async fn rollback_and_finish(&self, mut conn: PooledConnection<D>) {
        match self
            .driver
            .execute_raw(&mut conn, self.driver.rollback_statement())
            .await
        {
            Ok(()) => conn.release(),
            Err(e) => {
                warn!(pool_key = %self.pool_key, error = %e, "Rollback failed, discarding connection");
                conn.discard();
            }
        }
    }

    /// Probe with a trivial query. Never errors.
    pub async fn health_check(&self) -> bool {
        let mut conn = match self.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(pool_key = %self.pool_key, error = %e, "Health check could not acquire");
                return false;
            }
        };

        conn.set_discard_on_drop(true);
        let result = self.driver.ping(&mut conn).await;
        Self::finish(conn, result.as_ref().err());
        match result {
            Ok(()) => true,
            Err(e) => {
                debug!(pool_key = %self.pool_key, error = %e, "Health check failed");
                false
            }
        }
    }

    /// Stats of the attached pool; zeros while disconnected.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool().map(|p| p.stats()).unwrap_or_default()
    }

    /// Return a connection after a single statement: discard it when the error means the
    /// session is unusable.
    fn finish(conn: PooledConnection<D>, error: Option<&DbError>) {
        match error {
            Some(e) if e.is_connection_fatal() => conn.discard(),
            _ => conn.release(),
        }
    }
}

impl<D: Driver> std::fmt::Debug for SqlAdapter<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlAdapter")
            .field("dialect", &self.dialect())
            .field("pool_key", &self.pool_key)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Pool registries for every dialect.
///
/// Adapters built over the same `DialectPools` share a pool whenever their pool keys match.
#[derive(Debug)]
pub struct DialectPools {
    pub sqlite: Arc<PoolRegistry<SqliteDriver>>,
    pub mysql: Arc<PoolRegistry<MySqlDriver>>,
    pub postgres: Arc<PoolRegistry<PgDriver>>,
    #[cfg(feature = "mssql")]
    pub mssql: Arc<PoolRegistry<MssqlDriver>>,
}

impl DialectPools {
    pub fn new() -> Self {
        Self {
            sqlite: PoolRegistry::new(),
            mysql: PoolRegistry::new(),
            postgres: PoolRegistry::new(),
            #[cfg(feature = "mssql")]
            mssql: PoolRegistry::new(),
        }
    }

    /// Statistics summed over every pool of every dialect.
    pub fn stats(&self) -> PoolStats {
        let stats = self.sqlite.stats(None) + self.mysql.stats(None) + self.postgres.stats(None);
        #[cfg(feature = "mssql")]
        let stats = stats + self.mssql.stats(None);
        stats
    }
}

impl Default for DialectPools {
    fn default() -> Self {
        Self::new()
    }
}

/// Where one adapter connects: the primary or one read replica.
#[derive(Debug, Clone, Copy)]
pub struct AdapterTarget<'a> {
    pub driver: DatabaseDriver,
    /// Server host, or the database file for SQLite
    pub host: &'a str,
    pub port: u16,
    /// SQLite replicas open their file read-only
    pub read_only: bool,
}

/// An adapter of any supported dialect.
#[derive(Debug)]
pub enum Adapter {
    Sqlite(SqlAdapter<SqliteDriver>),
    MySql(SqlAdapter<MySqlDriver>),
    Postgres(PostgresAdapter),
    #[cfg(feature = "mssql")]
    Mssql(SqlAdapter<MssqlDriver>),
}

impl Adapter {
    /// Build the adapter for `target`, taking credentials and pool settings from `config`.
    pub fn build(
        config: &DatabaseConfig,
        target: AdapterTarget<'_>,
        pools: &DialectPools,
    ) -> DbResult<Self> {
        let pool_config = config
            .pooling
            .resolve(target.driver == DatabaseDriver::Sqlite);
        let username = config.username.as_deref();
        let password = config.password.as_deref();

        let adapter = match target.driver {
            DatabaseDriver::Sqlite => {
                let driver = SqliteDriver::new(target.host, target.read_only);
                let key = driver.pool_key();
                Self::Sqlite(SqlAdapter::new(
                    driver,
                    key,
                    pool_config,
                    Arc::clone(&pools.sqlite),
                ))
            }
            DatabaseDriver::MySql => {
                let driver = MySqlDriver::new(
                    target.host,
                    target.port,
                    &config.database,
                    username,
                    password,
                    config.ssl,
                );
                let key = driver.endpoint().to_string();
                Self::MySql(SqlAdapter::new(
                    driver,
                    key,
                    pool_config,
                    Arc::clone(&pools.mysql),
                ))
            }
            DatabaseDriver::Postgres => {
                let pg_config = PostgresAdapterConfig {
                    username: config.username.clone(),
                    password: config.password.clone(),
                    ssl: config.ssl,
                    pool: pool_config,
                    ..PostgresAdapterConfig::new(target.host, target.port, &config.database)
                };
                Self::Postgres(PostgresAdapter::new(pg_config, Arc::clone(&pools.postgres)))
            }
            #[cfg(feature = "mssql")]
            DatabaseDriver::Mssql => {
                let driver = MssqlDriver::new(
                    target.host,
                    target.port,
                    &config.database,
                    username,
                    password,
                    config.ssl,
                );
                let key = driver.endpoint().to_string();
                Self::Mssql(SqlAdapter::new(
                    driver,
                    key,
                    pool_config,
                    Arc::clone(&pools.mssql),
                ))
            }
            #[cfg(not(feature = "mssql"))]
            DatabaseDriver::Mssql => {
                return Err(DbError::invalid_input(
                    "SQL Server support is not compiled in; enable the `mssql` feature",
                ));
            }
        };
        Ok(adapter)
    }

    pub fn dialect(&self) -> DatabaseDriver {
        dispatch_adapter!(self, a => a.dialect())
    }

    pub fn pool_key(&self) -> &str {
        dispatch_adapter!(self, a => a.pool_key())
    }

    pub fn placeholder_style(&self) -> PlaceholderStyle {
        dispatch_adapter!(self, a => a.placeholder_style())
    }

    pub async fn connect(&self) -> DbResult<()> {
        dispatch_adapter!(self, a => a.connect().await)
    }

    pub async fn disconnect(&self) {
        dispatch_adapter!(self, a => a.disconnect().await)
    }

    pub fn is_connected(&self) -> bool {
        dispatch_adapter!(self, a => a.is_connected())
    }

    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        dispatch_adapter!(self, a => a.query(sql, params).await)
    }

    pub async fn query_one(&self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        dispatch_adapter!(self, a => a.query_one(sql, params).await)
    }

    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        dispatch_adapter!(self, a => a.execute(sql, params).await)
    }

    pub async fn transaction<T, F>(&self, body: F) -> DbResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut dyn Executor) -> BoxFuture<'t, DbResult<T>> + Send,
    {
        dispatch_adapter!(self, a => a.transaction(body).await)
    }

    pub async fn health_check(&self) -> bool {
        dispatch_adapter!(self, a => a.health_check().await)
    }

    pub fn pool_stats(&self) -> PoolStats {
        dispatch_adapter!(self, a => a.pool_stats())
    }
}
