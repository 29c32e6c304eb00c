//! sqlgate - command line entry point.
//!
//! Connects with the configured database, runs one command and prints the result as JSON.

use sqlgate::config::{Command, Config};
use sqlgate::models::QueryParam;
use sqlgate::{Database, DbError};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr so stdout carries only command output.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Parse a JSON array of bind parameters.
fn parse_params(raw: &str) -> Result<Vec<QueryParam>, DbError> {
    let values: Vec<serde_json::Value> = serde_json::from_str(raw)
        .map_err(|e| DbError::invalid_input(format!("--params must be a JSON array: {}", e)))?;
    Ok(values.into_iter().map(QueryParam::from_json).collect())
}

async fn run(db: &Database, command: &Command) -> Result<serde_json::Value, DbError> {
    match command {
        Command::Query { sql, params, read } => {
            let params = parse_params(params)?;
            let rows = db.query(sql, &params, *read).await?;
            Ok(serde_json::Value::Array(
                rows.into_iter().map(serde_json::Value::Object).collect(),
            ))
        }
        Command::Execute { sql, params } => {
            let params = parse_params(params)?;
            let affected = db.execute(sql, &params).await?;
            Ok(serde_json::json!({ "rows_affected": affected }))
        }
        Command::Health => {
            let healthy = db.health_check().await;
            Ok(serde_json::json!({ "healthy": healthy }))
        }
        Command::Stats => serde_json::to_value(db.pool_stats())
            .map_err(|e| DbError::internal(format!("Failed to serialize stats: {}", e))),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse_args();

    init_tracing(&config);

    let db_config = config.database_config()?;
    info!(
        driver = %db_config.driver,
        read_hosts = db_config.read_hosts.len(),
        "Starting sqlgate v{}",
        env!("CARGO_PKG_VERSION")
    );

    let db = Database::new(db_config);
    if let Err(e) = db.connect().await {
        error!(error = %e, "Failed to connect");
        if let Some(suggestion) = e.suggestion() {
            eprintln!("Hint: {}", suggestion);
        }
        return Err(e.into());
    }

    let result = run(&db, &config.command).await;
    db.disconnect().await;

    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    if matches!(config.command, Command::Health) && output["healthy"] != true {
        std::process::exit(1);
    }
    Ok(())
}
