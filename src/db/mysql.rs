//! MySQL / MariaDB driver.

use crate::db::driver::Driver;
use crate::db::params::mysql_query;
use crate::db::pool::ManageConnection;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseDriver, QueryParam, Row};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlSslMode};
use sqlx::{ConnectOptions, Connection};
use tracing::debug;

/// Connection settings for one MySQL endpoint.
#[derive(Debug, Clone)]
pub struct MySqlDriver {
    endpoint: String,
    options: MySqlConnectOptions,
}

impl MySqlDriver {
    pub fn new(
        host: &str,
        port: u16,
        database: &str,
        username: Option<&str>,
        password: Option<&str>,
        ssl: bool,
    ) -> Self {
        let mut options = MySqlConnectOptions::new()
            .host(host)
            .port(port)
            .charset("utf8mb4")
            .ssl_mode(if ssl {
                MySqlSslMode::Required
            } else {
                MySqlSslMode::Preferred
            });
        if !database.is_empty() {
            options = options.database(database);
        }
        if let Some(username) = username {
            options = options.username(username);
        }
        if let Some(password) = password {
            options = options.password(password);
        }
        Self {
            endpoint: format!("{}:{}/{}", host, port, database),
            options,
        }
    }

    /// `host:port/database`, also used as the pool key.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ManageConnection for MySqlDriver {
    type Connection = MySqlConnection;

    async fn connect(&self) -> DbResult<MySqlConnection> {
        self.options.connect().await.map_err(|e| {
            DbError::connection(
                format!("Failed to connect to {}: {}", self.endpoint, e),
                "Check the connection credentials are correct",
            )
        })
    }

    async fn close(&self, conn: MySqlConnection) {
        if let Err(e) = conn.close().await {
            debug!(endpoint = %self.endpoint, error = %e, "Error closing MySQL connection");
        }
    }
}

#[async_trait]
impl Driver for MySqlDriver {
    fn dialect(&self) -> DatabaseDriver {
        DatabaseDriver::MySql
    }

    async fn fetch_all(
        &self,
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<Row>> {
        let rows = mysql_query(sql, params).fetch_all(&mut *conn).await?;
        Ok(rows.iter().map(RowToJson::to_json_map).collect())
    }

    async fn execute(
        &self,
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<u64>> {
        let result = mysql_query(sql, params).execute(&mut *conn).await?;
        Ok(Some(result.rows_affected()))
    }

    async fn execute_raw(&self, conn: &mut MySqlConnection, sql: &str) -> DbResult<()> {
        sqlx::Executor::execute(&mut *conn, sql).await?;
        Ok(())
    }
}
