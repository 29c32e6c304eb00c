//! Error types for the database connectivity layer.
//!
//! All fallible operations return [`DbResult`]. Each variant carries enough context
//! (pool key, SQLSTATE, suggestion) for a caller to decide whether to retry.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Not connected: {target}. Call connect() first")]
    NotConnected { target: String },

    #[error("Pool exhausted: no connection available for '{pool_key}' after {waited_ms}ms")]
    PoolExhausted { pool_key: String, waited_ms: u64 },

    #[error("Pool closed: '{pool_key}' is shutting down")]
    PoolClosed { pool_key: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Query error: {message}")]
    Query {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
    },

    #[error("Transaction error: {message}")]
    Transaction { message: String },

    #[error("Schema creation failed for '{schema}': {message}")]
    SchemaCreation { schema: String, message: String },

    #[error("Migration '{name}' failed: {message}")]
    Migration { name: String, message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a not-connected error for the given adapter or pool.
    pub fn not_connected(target: impl Into<String>) -> Self {
        Self::NotConnected {
            target: target.into(),
        }
    }

    /// Create a pool exhausted error.
    pub fn pool_exhausted(pool_key: impl Into<String>, waited_ms: u64) -> Self {
        Self::PoolExhausted {
            pool_key: pool_key.into(),
            waited_ms,
        }
    }

    /// Create a pool closed error.
    pub fn pool_closed(pool_key: impl Into<String>) -> Self {
        Self::PoolClosed {
            pool_key: pool_key.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a query error with optional SQL state.
    pub fn query(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql_state,
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    pub fn schema_creation(schema: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaCreation {
            schema: schema.into(),
            message: message.into(),
        }
    }

    pub fn migration(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Migration {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::PoolExhausted { .. } => {
                Some("Increase max_connections or release connections sooner")
            }
            Self::NotConnected { .. } => Some("Call connect() before issuing queries"),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::PoolExhausted { .. })
    }

    /// Whether the physical connection that produced this error must be thrown away
    /// instead of being returned to its pool.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection settings and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::query(db_err.message(), code)
            }
            sqlx::Error::RowNotFound => DbError::query("No rows returned", None),
            sqlx::Error::PoolTimedOut => DbError::pool_exhausted("sqlx", 0),
            sqlx::Error::PoolClosed => DbError::pool_closed("sqlx"),
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::query(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "Reconnect to the database",
            ),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

#[cfg(feature = "mssql")]
impl From<tiberius::error::Error> for DbError {
    fn from(err: tiberius::error::Error) -> Self {
        match err {
            tiberius::error::Error::Server(token) => {
                DbError::query(token.message().to_string(), Some(token.code().to_string()))
            }
            tiberius::error::Error::Io { message, .. } => DbError::connection(
                format!("I/O error: {}", message),
                "Check network connectivity and database server status",
            ),
            tiberius::error::Error::Tls(msg) => DbError::connection(
                format!("TLS error: {}", msg),
                "Verify TLS configuration and certificates",
            ),
            other => DbError::internal(format!("SQL Server error: {}", other)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
