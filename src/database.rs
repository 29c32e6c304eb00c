//! Database facade.
//!
//! [`Database`] owns one configuration and everything built from it: the write adapter,
//! one read adapter per replica, the round-robin router, and the before/after query
//! listeners. Application code talks to this type only.

use crate::config::{DatabaseConfig, split_host_port};
use crate::db::adapter::{Adapter, AdapterTarget, DialectPools};
use crate::db::driver::Executor;
use crate::db::pool::PoolStats;
use crate::db::router::ReadRouter;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseDriver, QueryEvent, QueryParam, Row};
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

/// Callback invoked with every query event.
pub type QueryListener = Arc<dyn Fn(&QueryEvent) + Send + Sync>;

/// Handle returned when registering a listener, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    entries: RwLock<Vec<(ListenerId, QueryListener)>>,
}

impl Listeners {
    fn add(&self, id: ListenerId, listener: QueryListener) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    /// Call every listener in registration order, outside the lock.
    fn emit(&self, event: &QueryEvent) {
        let snapshot: Vec<QueryListener> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Adapters of one connected session.
#[derive(Debug)]
struct Routes {
    write: Adapter,
    reads: ReadRouter<Adapter>,
}

impl Routes {
    /// Next read replica, or the write adapter when there are none.
    fn target(&self, is_read: bool) -> &Adapter {
        if is_read {
            self.reads.next().unwrap_or(&self.write)
        } else {
            &self.write
        }
    }

    fn all(&self) -> impl Iterator<Item = &Adapter> {
        std::iter::once(&self.write).chain(self.reads.targets())
    }
}

/// Configured database with read/write routing and query hooks.
pub struct Database {
    config: DatabaseConfig,
    driver: DatabaseDriver,
    pools: DialectPools,
    routes: RwLock<Option<Arc<Routes>>>,
    /// Serializes connect/disconnect
    lifecycle: TokioMutex<()>,
    before: Listeners,
    after: Listeners,
    next_listener_id: AtomicU64,
}

impl Database {
    /// Create a disconnected facade. An unknown driver falls back to SQLite.
    pub fn new(config: DatabaseConfig) -> Self {
        let (driver, recognized) = config.resolve_driver();
        if !recognized {
            warn!(
                requested = %config.driver,
                fallback = %driver,
                "Unknown database driver, falling back"
            );
        }
        Self {
            config,
            driver,
            pools: DialectPools::new(),
            routes: RwLock::new(None),
            lifecycle: TokioMutex::new(()),
            before: Listeners::default(),
            after: Listeners::default(),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Dialect in use after resolving the configured driver tag.
    pub fn driver(&self) -> DatabaseDriver {
        self.driver
    }

    pub fn is_connected(&self) -> bool {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn routes(&self) -> DbResult<Arc<Routes>> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| DbError::not_connected(self.driver.display_name()))
    }

    fn target<'a>(&self, host: &'a str, port: u16, read_only: bool) -> AdapterTarget<'a> {
        AdapterTarget {
            driver: self.driver,
            host,
            port,
            read_only,
        }
    }

    /// Connect the write adapter and every read replica.
    ///
    /// Does nothing when already connected. If any adapter fails to connect, the ones
    /// already connected are disconnected again and the error is returned.
    pub async fn connect(&self) -> DbResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            debug!(driver = %self.driver, "Already connected");
            return Ok(());
        }

        let port = self.config.port_or_default(self.driver);
        let primary_host = match self.driver {
            DatabaseDriver::Sqlite => self.config.database.as_str(),
            _ => self.config.host.as_str(),
        };
        let write = Adapter::build(
            &self.config,
            self.target(primary_host, port, false),
            &self.pools,
        )?;

        let mut reads = Vec::with_capacity(self.config.read_hosts.len());
        for entry in &self.config.read_hosts {
            let adapter = match self.driver {
                DatabaseDriver::Sqlite => {
                    Adapter::build(&self.config, self.target(entry, port, true), &self.pools)?
                }
                _ => {
                    let (host, replica_port) = split_host_port(entry);
                    Adapter::build(
                        &self.config,
                        self.target(&host, replica_port.unwrap_or(port), true),
                        &self.pools,
                    )?
                }
            };
            reads.push(adapter);
        }

        let routes = Routes {
            write,
            reads: ReadRouter::new(reads),
        };
        let mut connected: Vec<&Adapter> = Vec::new();
        for adapter in routes.all() {
            if let Err(e) = adapter.connect().await {
                warn!(pool_key = %adapter.pool_key(), error = %e, "Connect failed, rolling back");
                for adapter in connected {
                    adapter.disconnect().await;
                }
                return Err(e);
            }
            connected.push(adapter);
        }

        info!(
            driver = %self.driver,
            primary = %routes.write.pool_key(),
            read_replicas = routes.reads.len(),
            "Database connected"
        );
        *self.routes.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(routes));
        Ok(())
    }

    /// Disconnect every adapter. Does nothing when not connected.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let routes = self
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(routes) = routes else {
            return;
        };

        for adapter in routes.all() {
            adapter.disconnect().await;
        }
        info!(driver = %self.driver, "Database disconnected");
    }

    /// Run a query.
    ///
    /// Reads rotate over the read replicas, starting with the first; without replicas, and
    /// for every non-read, the write adapter is used.
    pub async fn query(&self, sql: &str, params: &[QueryParam], is_read: bool) -> DbResult<Vec<Row>> {
        let routes = self.routes()?;
        let adapter = routes.target(is_read);
        self.observe(sql, params, is_read, adapter.query(sql, params))
            .await
    }

    /// Run a statement on the write adapter and return the affected row count.
    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let routes = self.routes()?;
        self.observe(sql, params, false, routes.write.execute(sql, params))
            .await
    }

    /// Run `body` in a transaction on the write adapter.
    ///
    /// Every statement issued through the executor handed to `body` uses the same
    /// connection.
    ///
    /// # Example
    ///
    /// ```ignore
    /// db.transaction(|tx| {
    ///     Box::pin(async move {
    ///         tx.execute("UPDATE accounts SET balance = balance - 10 WHERE id = ?", &[1.into()]).await?;
    ///         tx.execute("UPDATE accounts SET balance = balance + 10 WHERE id = ?", &[2.into()]).await
    ///     })
    /// })
    /// .await?;
    /// ```
    pub async fn transaction<T, F>(&self, body: F) -> DbResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut dyn Executor) -> BoxFuture<'t, DbResult<T>> + Send,
    {
        let routes = self.routes()?;
        routes.write.transaction(body).await
    }

    async fn observe<T>(
        &self,
        sql: &str,
        params: &[QueryParam],
        is_read: bool,
        dispatch: impl Future<Output = DbResult<T>>,
    ) -> DbResult<T> {
        let mut event = QueryEvent::new(sql, params, is_read);
        self.before.emit(&event);

        let started = Instant::now();
        let result = dispatch.await;
        event.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if let Err(e) = &result {
            event.error = Some(e.to_string());
        }

        self.after.emit(&event);
        result
    }

    fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a listener called before every query is dispatched.
    pub fn on_before_query<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&QueryEvent) + Send + Sync + 'static,
    {
        let id = self.next_listener_id();
        self.before.add(id, Arc::new(listener));
        id
    }

    /// Remove a before-listener. Returns whether it was registered.
    pub fn off_before_query(&self, id: ListenerId) -> bool {
        self.before.remove(id)
    }

    /// Register a listener called after every query completes, successfully or not.
    pub fn on_after_query<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&QueryEvent) + Send + Sync + 'static,
    {
        let id = self.next_listener_id();
        self.after.add(id, Arc::new(listener));
        id
    }

    /// Remove an after-listener. Returns whether it was registered.
    pub fn off_after_query(&self, id: ListenerId) -> bool {
        self.after.remove(id)
    }

    /// Statistics summed over every pool this facade uses.
    pub fn pool_stats(&self) -> PoolStats {
        self.pools.stats()
    }

    /// Probe the write adapter and every replica. `false` when disconnected. Never errors.
    pub async fn health_check(&self) -> bool {
        let Ok(routes) = self.routes() else {
            return false;
        };
        for adapter in routes.all() {
            if !adapter.health_check().await {
                warn!(pool_key = %adapter.pool_key(), "Health check failed");
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("driver", &self.driver)
            .field("config", &self.config)
            .field("connected", &self.is_connected())
            .field("before_listeners", &self.before.len())
            .field("after_listeners", &self.after.len())
            .finish()
    }
}
