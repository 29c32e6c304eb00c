//! SQLite driver.

use crate::db::driver::Driver;
use crate::db::params::sqlite_query;
use crate::db::pool::ManageConnection;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseDriver, QueryParam, Row};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use std::time::Duration;
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Driver for a single SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteDriver {
    path: String,
    read_only: bool,
    options: SqliteConnectOptions,
}

impl SqliteDriver {
    /// Open `path`, creating the file when writable. Read-only drivers never create it.
    pub fn new(path: impl Into<String>, read_only: bool) -> Self {
        let path = path.into();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(!read_only)
            .read_only(read_only)
            .busy_timeout(BUSY_TIMEOUT);
        Self {
            path,
            read_only,
            options,
        }
    }

    /// Pool key for this file. Read-only handles never share a pool with writable ones.
    pub fn pool_key(&self) -> String {
        if self.read_only {
            format!("sqlite:{}?mode=ro", self.path)
        } else {
            format!("sqlite:{}", self.path)
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl ManageConnection for SqliteDriver {
    type Connection = SqliteConnection;

    async fn connect(&self) -> DbResult<SqliteConnection> {
        self.options.connect().await.map_err(|e| {
            DbError::connection(
                format!("Failed to open SQLite database '{}': {}", self.path, e),
                "Check that the database file exists and is accessible",
            )
        })
    }

    async fn close(&self, conn: SqliteConnection) {
        if let Err(e) = conn.close().await {
            debug!(path = %self.path, error = %e, "Error closing SQLite connection");
        }
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    fn dialect(&self) -> DatabaseDriver {
        DatabaseDriver::Sqlite
    }

    async fn fetch_all(
        &self,
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<Row>> {
        let rows = sqlite_query(sql, params).fetch_all(&mut *conn).await?;
        Ok(rows.iter().map(RowToJson::to_json_map).collect())
    }

    async fn execute(
        &self,
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<u64>> {
        let result = sqlite_query(sql, params).execute(&mut *conn).await?;
        Ok(Some(result.rows_affected()))
    }

    async fn execute_raw(&self, conn: &mut SqliteConnection, sql: &str) -> DbResult<()> {
        sqlx::Executor::execute(&mut *conn, sql).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::driver::{Executor, Session};

    #[tokio::test]
    async fn test_roundtrip_on_single_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unit.db");
        let driver = SqliteDriver::new(path.to_string_lossy(), false);
        let mut conn = driver.connect().await.unwrap();

        let mut session = Session::new(&driver, &mut conn);
        session
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .await
            .unwrap();
        let inserted = session
            .execute("INSERT INTO t (name) VALUES (?), (?)", &["a".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        let row = session
            .query_one("SELECT name FROM t WHERE id = ?", &[2i64.into()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["name"], "b");

        driver.close(conn).await;
    }

    #[tokio::test]
    async fn test_read_only_driver_does_not_create_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.db");
        let driver = SqliteDriver::new(path.to_string_lossy(), true);

        let err = driver.connect().await.unwrap_err();
        assert!(err.is_connection_fatal());
        assert!(!path.exists());
    }

    #[test]
    fn test_pool_key() {
        assert_eq!(
            SqliteDriver::new("/tmp/app.db", false).pool_key(),
            "sqlite:/tmp/app.db"
        );
        assert_eq!(
            SqliteDriver::new("/tmp/app.db", true).pool_key(),
            "sqlite:/tmp/app.db?mode=ro"
        );
    }
}
