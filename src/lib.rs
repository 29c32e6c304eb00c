//! sqlgate - database connectivity layer.
//!
//! Bounded keyed connection pools, adapters for SQLite, PostgreSQL, MySQL and (with the
//! `mssql` feature) SQL Server, round-robin read-replica routing, and a [`Database`]
//! facade with query hooks and transactions.

pub mod config;
pub mod database;
pub mod db;
pub mod error;
pub mod models;

pub use config::{DatabaseConfig, PoolOptions};
pub use database::{Database, ListenerId, QueryListener};
pub use error::{DbError, DbResult};
