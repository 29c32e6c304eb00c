//! Database access layer.
//!
//! - Connection pooling and keyed pool registries
//! - Per-dialect drivers and the uniform adapter built over them
//! - The isolation-aware Postgres adapter and its registry
//! - Read-replica routing
//! - Parameter binding and row decoding

pub mod adapter;
pub mod adapter_registry;
pub mod database_pool;
pub mod driver;
mod macros;
#[cfg(feature = "mssql")]
pub mod mssql;
pub mod mysql;
pub mod params;
pub mod pool;
pub mod postgres;
pub mod router;
pub mod sqlite;
pub mod types;

pub use adapter::{Adapter, AdapterTarget, DialectPools, SqlAdapter};
pub use adapter_registry::AdapterRegistry;
pub use database_pool::PoolRegistry;
pub use driver::{Driver, Executor, Session};
#[cfg(feature = "mssql")]
pub use mssql::MssqlDriver;
pub use mysql::MySqlDriver;
pub use pool::{
    ConnectionPool, ErrorHandler, ManageConnection, PoolConfig, PoolStats, PooledConnection,
};
pub use postgres::{
    Migration, PgDriver, PostgresAdapter, PostgresAdapterConfig, SqlMigration,
};
pub use router::ReadRouter;
pub use sqlite::SqliteDriver;
