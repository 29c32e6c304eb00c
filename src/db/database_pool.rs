//! Keyed pool registry.
//!
//! A [`PoolRegistry`] partitions connections into independent [`ConnectionPool`]s by
//! pool key. Adapters whose configurations map to the same key share one pool; adapters
//! with different keys never share connections.
//!
//! # Design Decisions
//!
//! - **Synchronous map lock**: creating a pool opens no connection, so the map is guarded
//!   by a `std::sync::Mutex` that is never held across an await
//! - **User counting**: each connected adapter attaches to its pool; the pool is drained
//!   only when the last user detaches

use crate::db::pool::{ConnectionPool, ManageConnection, PoolConfig, PoolStats, PooledConnection};
use crate::error::{DbError, DbResult};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

struct RegistryEntry<M: ManageConnection> {
    pool: Arc<ConnectionPool<M>>,
    users: usize,
}

/// Pools for one connection manager type, keyed by pool key.
pub struct PoolRegistry<M: ManageConnection> {
    pools: Mutex<HashMap<String, RegistryEntry<M>>>,
}

impl<M: ManageConnection> Default for PoolRegistry<M> {
    fn default() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
        }
    }
}

impl<M: ManageConnection> PoolRegistry<M> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get the pool for `key`, creating it over `manager` when absent.
    ///
    /// The boolean is `true` when the pool was created by this call. An existing pool
    /// keeps its own manager and configuration.
    pub fn get_or_create(
        &self,
        key: &str,
        config: &PoolConfig,
        manager: Arc<M>,
    ) -> (Arc<ConnectionPool<M>>, bool) {
        self.entry(key, config, manager, false)
    }

    /// Like [`get_or_create`](Self::get_or_create), and count the caller as a user.
    pub fn attach(
        &self,
        key: &str,
        config: &PoolConfig,
        manager: Arc<M>,
    ) -> (Arc<ConnectionPool<M>>, bool) {
        self.entry(key, config, manager, true)
    }

    fn entry(
        &self,
        key: &str,
        config: &PoolConfig,
        manager: Arc<M>,
        attach: bool,
    ) -> (Arc<ConnectionPool<M>>, bool) {
        let mut pools = self.lock();
        let fresh = |manager: Arc<M>| RegistryEntry {
            pool: ConnectionPool::new(key, manager, config.clone()),
            users: 0,
        };
        let (entry, created) = match pools.entry(key.to_string()) {
            Entry::Occupied(occupied) if !occupied.get().pool.is_closed() => {
                (occupied.into_mut(), false)
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(fresh(manager));
                (occupied.into_mut(), true)
            }
            Entry::Vacant(vacant) => (vacant.insert(fresh(manager)), true),
        };

        if created {
            info!(pool_key = %key, max = config.max_connections, "Created connection pool");
        }
        if attach {
            entry.users += 1;
            debug!(pool_key = %key, users = entry.users, "Attached to pool");
        }
        (Arc::clone(&entry.pool), created)
    }

    /// Drop one user of `key`. When the last user leaves the pool is removed and drained.
    pub async fn detach(&self, key: &str) {
        let removed = {
            let mut pools = self.lock();
            match pools.get_mut(key) {
                Some(entry) => {
                    entry.users = entry.users.saturating_sub(1);
                    debug!(pool_key = %key, users = entry.users, "Detached from pool");
                    if entry.users == 0 {
                        pools.remove(key).map(|e| e.pool)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        if let Some(pool) = removed {
            pool.drain().await;
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<ConnectionPool<M>>> {
        self.lock().get(key).map(|e| Arc::clone(&e.pool))
    }

    /// Acquire a connection from the pool registered under `key`.
    pub async fn acquire(&self, key: &str) -> DbResult<PooledConnection<M>> {
        let pool = self.get(key).ok_or_else(|| DbError::not_connected(key))?;
        pool.acquire().await
    }

    /// Stats for one key, or aggregated across every key for `None`.
    pub fn stats(&self, key: Option<&str>) -> PoolStats {
        let pools = self.lock();
        match key {
            Some(key) => pools.get(key).map(|e| e.pool.stats()).unwrap_or_default(),
            None => pools.values().map(|e| e.pool.stats()).sum(),
        }
    }

    /// Drain one pool, or every pool for `None`. Drained pools are removed.
    pub async fn drain(&self, key: Option<&str>) {
        let drained: Vec<Arc<ConnectionPool<M>>> = {
            let mut pools = self.lock();
            match key {
                Some(key) => pools.remove(key).map(|e| e.pool).into_iter().collect(),
                None => pools.drain().map(|(_, e)| e.pool).collect(),
            }
        };

        for pool in drained {
            pool.drain().await;
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RegistryEntry<M>>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<M: ManageConnection> std::fmt::Debug for PoolRegistry<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}
