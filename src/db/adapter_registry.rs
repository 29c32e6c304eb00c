//! Registry of named Postgres adapters.
//!
//! Collaborators look adapters up by a logical key (usually the service name) instead of
//! threading them through every call site. The registry is an ordinary value: create one,
//! share it behind an `Arc`, and tear it down with [`AdapterRegistry::disconnect_all`].
//! All adapters it creates share one [`PoolRegistry`], so equal pool keys share one pool.

use crate::db::database_pool::PoolRegistry;
use crate::db::pool::PoolStats;
use crate::db::postgres::{PgDriver, PostgresAdapter, PostgresAdapterConfig};
use crate::error::DbResult;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

pub struct AdapterRegistry {
    pools: Arc<PoolRegistry<PgDriver>>,
    adapters: Mutex<HashMap<String, Arc<PostgresAdapter>>>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self {
            pools: PoolRegistry::new(),
            adapters: Mutex::new(HashMap::new()),
        }
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<PostgresAdapter>>> {
        self.adapters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adapter registered under `key`, created from `config` on first use.
    ///
    /// A later call with the same key returns the existing adapter; its `config` is ignored.
    pub fn get_or_create(&self, key: &str, config: PostgresAdapterConfig) -> Arc<PostgresAdapter> {
        let mut adapters = self.lock();
        if let Some(existing) = adapters.get(key) {
            debug!(key = %key, "Returning registered adapter");
            return Arc::clone(existing);
        }

        let adapter = Arc::new(PostgresAdapter::new(config, Arc::clone(&self.pools)));
        info!(key = %key, pool_key = %adapter.pool_key(), mode = %adapter.mode(), "Registered adapter");
        adapters.insert(key.to_string(), Arc::clone(&adapter));
        adapter
    }

    pub fn get(&self, key: &str) -> Option<Arc<PostgresAdapter>> {
        self.lock().get(key).cloned()
    }

    /// Connect every registered adapter, stopping at the first failure.
    pub async fn init(&self) -> DbResult<()> {
        let adapters: Vec<_> = self.lock().values().cloned().collect();
        for adapter in adapters {
            adapter.connect().await?;
        }
        Ok(())
    }

    /// Disconnect every adapter and empty the registry.
    pub async fn disconnect_all(&self) {
        let adapters: Vec<_> = self.lock().drain().map(|(_, adapter)| adapter).collect();
        let count = adapters.len();
        for adapter in adapters {
            adapter.disconnect().await;
        }
        info!(count, "Disconnected all adapters");
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Pools shared by the registered adapters.
    pub fn pools(&self) -> &Arc<PoolRegistry<PgDriver>> {
        &self.pools
    }

    /// Statistics summed over every pool.
    pub fn pool_stats(&self) -> PoolStats {
        self.pools.stats(None)
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("keys", &self.keys())
            .field("pools", &self.pools.len())
            .finish()
    }
}
