//! Dialect driver contract.
//!
//! A [`Driver`] is the per-dialect wrapper around a wire-protocol connection: it opens and
//! closes connections for the pool and runs statements on one connection. Everything
//! above it (pooling, transactions, routing) is dialect-agnostic.

use crate::db::pool::ManageConnection;
use crate::error::DbResult;
use crate::models::{DatabaseDriver, PlaceholderStyle, QueryParam, Row};
use async_trait::async_trait;

/// Statements against a single physical connection.
#[async_trait]
pub trait Driver: ManageConnection {
    fn dialect(&self) -> DatabaseDriver;

    fn placeholder_style(&self) -> PlaceholderStyle {
        self.dialect().placeholder_style()
    }

    fn begin_statement(&self) -> &'static str {
        "BEGIN"
    }

    fn commit_statement(&self) -> &'static str {
        "COMMIT"
    }

    fn rollback_statement(&self) -> &'static str {
        "ROLLBACK"
    }

    /// Run a query and decode every returned row.
    async fn fetch_all(
        &self,
        conn: &mut Self::Connection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<Row>>;

    /// Run a statement. `None` when the backend reports no row count.
    async fn execute(
        &self,
        conn: &mut Self::Connection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<u64>>;

    /// Run an unprepared control statement such as `BEGIN` or `SET ...`.
    async fn execute_raw(&self, conn: &mut Self::Connection, sql: &str) -> DbResult<()>;

    /// Trivial round-trip used by health checks.
    async fn ping(&self, conn: &mut Self::Connection) -> DbResult<()> {
        self.execute_raw(conn, "SELECT 1").await
    }
}

/// Query surface handed to transaction bodies and migrations.
///
/// Every call goes to the same physical connection.
#[async_trait]
pub trait Executor: Send {
    fn dialect(&self) -> DatabaseDriver;

    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>>;

    /// First row of the result, if any.
    async fn query_one(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Run a statement and return the affected row count (0 when not reported).
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64>;
}

/// An [`Executor`] bound to one borrowed connection.
pub struct Session<'c, D: Driver> {
    driver: &'c D,
    conn: &'c mut D::Connection,
}

impl<'c, D: Driver> Session<'c, D> {
    pub fn new(driver: &'c D, conn: &'c mut D::Connection) -> Self {
        Self { driver, conn }
    }
}

#[async_trait]
impl<'c, D: Driver> Executor for Session<'c, D> {
    fn dialect(&self) -> DatabaseDriver {
        self.driver.dialect()
    }

    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.driver.fetch_all(self.conn, sql, params).await
    }

    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        Ok(self
            .driver
            .execute(self.conn, sql, params)
            .await?
            .unwrap_or(0))
    }
}
