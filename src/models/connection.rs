//! Connection-related data models.
//!
//! This module defines the dialect tags, placeholder styles and isolation modes
//! shared by configuration, adapters and the facade.

use serde::{Deserialize, Serialize};

/// Supported database dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    /// Embedded single-file database; the fallback for unrecognised tags.
    Sqlite,
    Postgres,
    /// Includes MariaDB
    MySql,
    /// SQL Server (requires the `mssql` feature)
    Mssql,
}

impl DatabaseDriver {
    /// Dialect used when a configured tag is not recognised.
    pub const FALLBACK: DatabaseDriver = DatabaseDriver::Sqlite;

    /// Parse a driver tag; `None` for tags this crate does not know.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" | "file" => Some(Self::Sqlite),
            "postgres" | "postgresql" | "pg" => Some(Self::Postgres),
            "mysql" | "mariadb" => Some(Self::MySql),
            "mssql" | "sqlserver" | "sql-server" => Some(Self::Mssql),
            _ => None,
        }
    }

    /// Parse a driver tag, falling back to [`DatabaseDriver::FALLBACK`].
    ///
    /// The boolean is `false` when the fallback was used.
    pub fn resolve(tag: &str) -> (Self, bool) {
        match Self::from_tag(tag) {
            Some(driver) => (driver, true),
            None => (Self::FALLBACK, false),
        }
    }

    /// Parse the dialect from a connection URL scheme.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let scheme = connection_string.split(':').next().unwrap_or_default();
        Self::from_tag(scheme)
    }

    /// Canonical tag for this dialect.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::Mssql => "mssql",
        }
    }

    /// Get the display name for this dialect.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Sqlite => "SQLite",
            Self::Postgres => "PostgreSQL",
            Self::MySql => "MySQL",
            Self::Mssql => "SQL Server",
        }
    }

    /// Get the default port for this dialect.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Postgres => Some(5432),
            Self::MySql => Some(3306),
            Self::Mssql => Some(1433),
            Self::Sqlite => None,
        }
    }

    pub fn placeholder_style(&self) -> PlaceholderStyle {
        match self {
            Self::Sqlite | Self::MySql => PlaceholderStyle::Positional,
            Self::Postgres => PlaceholderStyle::Numbered,
            Self::Mssql => PlaceholderStyle::Named,
        }
    }
}

impl std::fmt::Display for DatabaseDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Bind-parameter syntax of a dialect. Informational: consumed by query builders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderStyle {
    /// `?`
    Positional,
    /// `$1`, `$2`, ...
    Numbered,
    /// `@P1`, `@P2`, ...
    Named,
}

impl PlaceholderStyle {
    /// Render the placeholder for the 1-based parameter index `n`.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Self::Positional => "?".to_string(),
            Self::Numbered => format!("${}", n),
            Self::Named => format!("@P{}", n),
        }
    }
}

/// Schema isolation mode for Postgres adapters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// One schema shared by every caller.
    #[default]
    Shared,
    /// One schema per logical service inside the same physical database.
    Isolated,
}

impl std::fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::Isolated => write!(f, "isolated"),
        }
    }
}
