//! Isolation-aware Postgres adapter.
//!
//! Two deployment modes share one physical database:
//!
//! - **Shared**: every caller uses one schema; pool key `host:port/database`
//! - **Isolated**: each logical service gets its own schema, selected through the
//!   connection's `search_path`; pool key `host:port/database/service`
//!
//! Adapters whose configurations produce the same pool key share one pool when they
//! are built over the same [`PoolRegistry`].

use crate::db::adapter::SqlAdapter;
use crate::db::database_pool::PoolRegistry;
use crate::db::driver::{Driver, Executor, Session};
use crate::db::params::postgres_query;
use crate::db::pool::{ConnectionPool, ManageConnection, PoolConfig, PoolStats};
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseDriver, IsolationMode, PlaceholderStyle, QueryParam, Row};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{ConnectOptions, Connection};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Postgres identifiers are truncated beyond this many bytes.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Configuration of one Postgres adapter.
#[derive(Clone, PartialEq)]
pub struct PostgresAdapterConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    /// Sensitive - not logged
    pub password: Option<String>,
    pub ssl: bool,
    pub mode: IsolationMode,
    /// Logical service; selects the schema in isolated mode
    pub service_name: Option<String>,
    pub pool: PoolConfig,
}

impl std::fmt::Debug for PostgresAdapterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresAdapterConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("ssl", &self.ssl)
            .field("mode", &self.mode)
            .field("service_name", &self.service_name)
            .field("pool", &self.pool)
            .finish()
    }
}

impl PostgresAdapterConfig {
    pub fn new(host: impl Into<String>, port: u16, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            username: None,
            password: None,
            ssl: false,
            mode: IsolationMode::Shared,
            service_name: None,
            pool: PoolConfig::default(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Switch to isolated mode for `service`.
    pub fn isolated(mut self, service: impl Into<String>) -> Self {
        self.mode = IsolationMode::Isolated;
        self.service_name = Some(service.into());
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Identity of the physical pool these settings need.
    ///
    /// Isolated mode without a service name falls back to the shared key.
    pub fn pool_key(&self) -> String {
        let base = format!("{}:{}/{}", self.host, self.port, self.database);
        match (self.mode, &self.service_name) {
            (IsolationMode::Isolated, Some(service)) => format!("{}/{}", base, service),
            _ => base,
        }
    }

    /// Schema connections are pinned to, only in isolated mode with a service.
    pub fn schema(&self) -> Option<String> {
        match (self.mode, &self.service_name) {
            (IsolationMode::Isolated, Some(service)) => Some(schema_name(service)),
            _ => None,
        }
    }
}

/// Schema name for a service: lowercased, with `-` mapped to `_`.
pub fn schema_name(service: &str) -> String {
    service.trim().to_lowercase().replace('-', "_")
}

/// Accept only plain identifiers so schema names can be interpolated into DDL.
pub fn validate_identifier(name: &str) -> DbResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_start || !valid_rest || name.len() > MAX_IDENTIFIER_LEN {
        return Err(DbError::invalid_input(format!(
            "'{}' is not a valid schema name: use letters, digits and underscores, at most {} characters",
            name, MAX_IDENTIFIER_LEN
        )));
    }
    Ok(())
}

/// Connection settings for one Postgres endpoint, optionally pinned to a schema.
#[derive(Debug, Clone)]
pub struct PgDriver {
    endpoint: String,
    options: PgConnectOptions,
}

impl PgDriver {
    pub fn new(config: &PostgresAdapterConfig) -> Self {
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .ssl_mode(if config.ssl {
                PgSslMode::Require
            } else {
                PgSslMode::Prefer
            });
        if let Some(username) = &config.username {
            options = options.username(username);
        }
        if let Some(password) = &config.password {
            options = options.password(password);
        }
        if let Some(schema) = config.schema() {
            options = options.options([("search_path", schema)]);
        }
        Self {
            endpoint: config.pool_key(),
            options,
        }
    }
}

#[async_trait]
impl ManageConnection for PgDriver {
    type Connection = PgConnection;

    async fn connect(&self) -> DbResult<PgConnection> {
        self.options.connect().await.map_err(|e| {
            DbError::connection(
                format!("Failed to connect to {}: {}", self.endpoint, e),
                "Check the connection credentials are correct",
            )
        })
    }

    async fn close(&self, conn: PgConnection) {
        if let Err(e) = conn.close().await {
            debug!(endpoint = %self.endpoint, error = %e, "Error closing Postgres connection");
        }
    }
}

#[async_trait]
impl Driver for PgDriver {
    fn dialect(&self) -> DatabaseDriver {
        DatabaseDriver::Postgres
    }

    async fn fetch_all(
        &self,
        conn: &mut PgConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<Row>> {
        let rows = postgres_query(sql, params).fetch_all(&mut *conn).await?;
        Ok(rows.iter().map(RowToJson::to_json_map).collect())
    }

    async fn execute(
        &self,
        conn: &mut PgConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<u64>> {
        let result = postgres_query(sql, params).execute(&mut *conn).await?;
        Ok(Some(result.rows_affected()))
    }

    async fn execute_raw(&self, conn: &mut PgConnection, sql: &str) -> DbResult<()> {
        sqlx::Executor::execute(&mut *conn, sql).await?;
        Ok(())
    }
}

/// One schema migration step.
#[async_trait]
pub trait Migration: Send + Sync {
    fn name(&self) -> &str;

    async fn up(&self, db: &mut dyn Executor) -> DbResult<()>;
}

/// A migration made of plain SQL statements run in order.
#[derive(Debug, Clone)]
pub struct SqlMigration {
    name: String,
    statements: Vec<String>,
}

impl SqlMigration {
    pub fn new<I, S>(name: impl Into<String>, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            statements: statements.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Migration for SqlMigration {
    fn name(&self) -> &str {
        &self.name
    }

    async fn up(&self, db: &mut dyn Executor) -> DbResult<()> {
        for statement in &self.statements {
            db.execute(statement, &[]).await?;
        }
        Ok(())
    }
}

/// Postgres adapter with shared or isolated schema mode.
#[derive(Debug)]
pub struct PostgresAdapter {
    config: PostgresAdapterConfig,
    inner: SqlAdapter<PgDriver>,
}

impl PostgresAdapter {
    /// Create an adapter whose pool is looked up in `pools` by pool key.
    pub fn new(config: PostgresAdapterConfig, pools: Arc<PoolRegistry<PgDriver>>) -> Self {
        let inner = SqlAdapter::new(
            PgDriver::new(&config),
            config.pool_key(),
            config.pool.clone(),
            pools,
        );
        Self { config, inner }
    }

    /// Create an adapter with a private pool registry.
    pub fn standalone(config: PostgresAdapterConfig) -> Self {
        Self::new(config, PoolRegistry::new())
    }

    pub fn config(&self) -> &PostgresAdapterConfig {
        &self.config
    }

    pub fn mode(&self) -> IsolationMode {
        self.config.mode
    }

    pub fn pool_key(&self) -> &str {
        self.inner.pool_key()
    }

    pub fn dialect(&self) -> DatabaseDriver {
        DatabaseDriver::Postgres
    }

    pub fn placeholder_style(&self) -> PlaceholderStyle {
        self.inner.placeholder_style()
    }

    /// Create or reuse the pool for this adapter's key.
    ///
    /// Background pool errors are logged, never raised. In isolated mode the service
    /// schema is bootstrapped best-effort. A second call logs and returns.
    pub async fn connect(&self) -> DbResult<()> {
        if self.inner.is_connected() {
            info!(pool_key = %self.pool_key(), "Adapter already connected, reusing existing pool");
            return Ok(());
        }

        let service = self.config.service_name.clone();
        self.inner.set_error_handler(Arc::new(move |pool_key, err| {
            error!(
                pool_key = %pool_key,
                service = service.as_deref().unwrap_or("-"),
                error = %err,
                "Postgres pool error"
            );
        }));
        self.inner.connect().await?;

        if let (IsolationMode::Isolated, Some(service)) =
            (self.config.mode, &self.config.service_name)
        {
            self.create_service_schema(service).await;
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// The underlying pool; [`DbError::NotConnected`] before [`connect`](Self::connect).
    pub fn get_pool(&self) -> DbResult<Arc<ConnectionPool<PgDriver>>> {
        self.inner.pool()
    }

    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.inner.query(sql, params).await
    }

    pub async fn query_one(&self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        self.inner.query_one(sql, params).await
    }

    /// Affected row count, 0 when Postgres reports none.
    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        self.inner.execute(sql, params).await
    }

    pub async fn transaction<T, F>(&self, body: F) -> DbResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut dyn Executor) -> BoxFuture<'t, DbResult<T>> + Send,
    {
        self.inner.transaction(body).await
    }

    /// Create the schema for `name` in isolated mode.
    ///
    /// Returns whether the schema exists afterwards. Shared mode is a no-op returning
    /// `false`; failures are logged and swallowed.
    pub async fn create_service_schema(&self, name: &str) -> bool {
        if self.config.mode == IsolationMode::Shared {
            info!(service = %name, "Shared mode, skipping service schema creation");
            return false;
        }

        let schema = schema_name(name);
        let result = match validate_identifier(&schema) {
            Ok(()) => self
                .inner
                .execute(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", schema), &[])
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(schema = %schema, "Service schema ready");
                true
            }
            Err(e) => {
                let err = DbError::schema_creation(&schema, e.to_string());
                warn!(schema = %schema, error = %err, "Continuing without service schema");
                false
            }
        }
    }

    /// Apply `migrations` in order on a single connection.
    ///
    /// Stops at the first failure and returns it; the connection is returned to the pool
    /// exactly once either way. Returns the number of migrations applied.
    pub async fn run_migrations(&self, migrations: &[Box<dyn Migration>]) -> DbResult<usize> {
        let mut conn = self.inner.acquire().await?;
        conn.set_discard_on_drop(true);

        let mut applied = 0;
        let mut failure = None;
        {
            let mut session = Session::new(self.inner.driver(), &mut *conn);
            for migration in migrations {
                debug!(pool_key = %self.pool_key(), migration = %migration.name(), "Applying migration");
                if let Err(e) = migration.up(&mut session).await {
                    failure = Some((migration.name().to_string(), e));
                    break;
                }
                applied += 1;
            }
        }

        match failure {
            None => {
                conn.release();
                info!(pool_key = %self.pool_key(), applied, "Migrations applied");
                Ok(applied)
            }
            Some((name, e)) => {
                if e.is_connection_fatal() {
                    conn.discard();
                } else {
                    conn.release();
                }
                warn!(migration = %name, error = %e, "Migration failed");
                Err(match e {
                    DbError::Migration { .. } => e,
                    other => DbError::migration(name, other.to_string()),
                })
            }
        }
    }

    /// `SELECT 1` probe. Never errors.
    pub async fn health_check(&self) -> bool {
        self.inner.health_check().await
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool_stats()
    }
}
