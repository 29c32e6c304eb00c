//! SQL Server driver over tiberius.

use crate::db::driver::Driver;
use crate::db::params::mssql_params;
use crate::db::pool::ManageConnection;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseDriver, QueryParam, Row};
use async_trait::async_trait;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

pub type MssqlConnection = Client<Compat<TcpStream>>;

/// Connection settings for one SQL Server endpoint.
#[derive(Debug, Clone)]
pub struct MssqlDriver {
    endpoint: String,
    config: Config,
}

impl MssqlDriver {
    pub fn new(
        host: &str,
        port: u16,
        database: &str,
        username: Option<&str>,
        password: Option<&str>,
        ssl: bool,
    ) -> Self {
        let mut config = Config::new();
        config.host(host);
        config.port(port);
        if !database.is_empty() {
            config.database(database);
        }
        if let Some(username) = username {
            config.authentication(AuthMethod::sql_server(username, password.unwrap_or("")));
        }
        if ssl {
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::Off);
            config.trust_cert();
        }
        Self {
            endpoint: format!("{}:{}/{}", host, port, database),
            config,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ManageConnection for MssqlDriver {
    type Connection = MssqlConnection;

    async fn connect(&self) -> DbResult<MssqlConnection> {
        let tcp = TcpStream::connect(self.config.get_addr())
            .await
            .map_err(|e| {
                DbError::connection(
                    format!("Failed to connect to {}: {}", self.endpoint, e),
                    "Check that SQL Server is running and reachable",
                )
            })?;
        tcp.set_nodelay(true).ok();

        Client::connect(self.config.clone(), tcp.compat_write())
            .await
            .map_err(|e| {
                DbError::connection(
                    format!("Failed to authenticate with {}: {}", self.endpoint, e),
                    "Check the connection credentials are correct",
                )
            })
    }

    async fn close(&self, conn: MssqlConnection) {
        if let Err(e) = conn.close().await {
            debug!(endpoint = %self.endpoint, error = %e, "Error closing SQL Server connection");
        }
    }
}

#[async_trait]
impl Driver for MssqlDriver {
    fn dialect(&self) -> DatabaseDriver {
        DatabaseDriver::Mssql
    }

    fn begin_statement(&self) -> &'static str {
        "BEGIN TRANSACTION"
    }

    fn commit_statement(&self) -> &'static str {
        "COMMIT TRANSACTION"
    }

    fn rollback_statement(&self) -> &'static str {
        "ROLLBACK TRANSACTION"
    }

    async fn fetch_all(
        &self,
        conn: &mut MssqlConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<Row>> {
        let refs = mssql_params(params);
        let stream = conn.query(sql, &refs).await?;
        let rows = stream.into_first_result().await?;
        Ok(rows.iter().map(RowToJson::to_json_map).collect())
    }

    async fn execute(
        &self,
        conn: &mut MssqlConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<u64>> {
        let refs = mssql_params(params);
        let result = conn.execute(sql, &refs).await?;
        Ok(Some(result.total()))
    }

    async fn execute_raw(&self, conn: &mut MssqlConnection, sql: &str) -> DbResult<()> {
        conn.simple_query(sql).await?.into_results().await?;
        Ok(())
    }
}
