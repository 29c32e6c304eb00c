//! Integration tests for the `Database` facade over SQLite files.

use sqlgate::db::Executor;
use sqlgate::models::{DatabaseDriver, QueryEvent};
use sqlgate::{Database, DatabaseConfig, DbError, PoolOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Create a SQLite file holding a one-row `marker` table naming it.
async fn create_marked_db(dir: &TempDir, name: &str) -> String {
    let path = path_str(&dir.path().join(format!("{name}.db")));
    let db = Database::new(DatabaseConfig::sqlite(&path));
    db.connect().await.unwrap();
    db.execute("CREATE TABLE marker (name TEXT NOT NULL)", &[])
        .await
        .unwrap();
    db.execute("INSERT INTO marker (name) VALUES (?)", &[name.into()])
        .await
        .unwrap();
    db.disconnect().await;
    path
}

async fn marker(db: &Database, is_read: bool) -> String {
    let rows = db
        .query("SELECT name FROM marker", &[], is_read)
        .await
        .unwrap();
    rows[0]["name"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_reads_round_robin_over_replicas() {
    let dir = tempfile::tempdir().unwrap();
    let primary = create_marked_db(&dir, "primary").await;
    let a = create_marked_db(&dir, "a").await;
    let b = create_marked_db(&dir, "b").await;

    let db = Database::new(DatabaseConfig::sqlite(&primary).with_read_hosts([a, b]));
    db.connect().await.unwrap();

    let mut reads = Vec::new();
    for _ in 0..4 {
        reads.push(marker(&db, true).await);
    }
    assert_eq!(reads, ["a", "b", "a", "b"]);

    assert_eq!(marker(&db, false).await, "primary");
    db.disconnect().await;
}

#[tokio::test]
async fn test_writes_go_to_primary() {
    let dir = tempfile::tempdir().unwrap();
    let primary = create_marked_db(&dir, "primary").await;
    let replica = create_marked_db(&dir, "replica").await;

    let db = Database::new(DatabaseConfig::sqlite(&primary).with_read_hosts([replica]));
    db.connect().await.unwrap();

    let inserted = db
        .execute("INSERT INTO marker (name) VALUES (?)", &["second".into()])
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let primary_rows = db.query("SELECT name FROM marker", &[], false).await.unwrap();
    assert_eq!(primary_rows.len(), 2);
    let replica_rows = db.query("SELECT name FROM marker", &[], true).await.unwrap();
    assert_eq!(replica_rows.len(), 1);
}

#[tokio::test]
async fn test_replica_is_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let primary = create_marked_db(&dir, "primary").await;
    let replica = create_marked_db(&dir, "replica").await;

    let db = Database::new(DatabaseConfig::sqlite(&primary).with_read_hosts([replica]));
    db.connect().await.unwrap();

    let err = db
        .query("INSERT INTO marker (name) VALUES ('nope')", &[], true)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Query { .. }));
}

#[tokio::test]
async fn test_reads_without_replicas_use_primary() {
    let dir = tempfile::tempdir().unwrap();
    let primary = create_marked_db(&dir, "primary").await;

    let db = Database::new(DatabaseConfig::sqlite(&primary));
    db.connect().await.unwrap();
    assert_eq!(marker(&db, true).await, "primary");
}

#[tokio::test]
async fn test_unknown_driver_uses_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = path_str(&dir.path().join("fallback.db"));

    let config = DatabaseConfig {
        database: path,
        ..DatabaseConfig::new("no-such-driver")
    };
    let db = Database::new(config);
    assert_eq!(db.driver(), DatabaseDriver::Sqlite);

    db.connect().await.unwrap();
    let rows = db.query("SELECT 1 + 1 AS two", &[], false).await.unwrap();
    assert_eq!(rows[0]["two"], 2);
}

#[tokio::test]
async fn test_connect_and_disconnect_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = path_str(&dir.path().join("idempotent.db"));
    let db = Database::new(DatabaseConfig::sqlite(&path));

    db.disconnect().await;
    db.connect().await.unwrap();
    db.connect().await.unwrap();
    assert!(db.is_connected());
    assert!(db.health_check().await);

    db.disconnect().await;
    db.disconnect().await;
    assert!(!db.is_connected());
    assert!(matches!(
        db.query("SELECT 1", &[], false).await.unwrap_err(),
        DbError::NotConnected { .. }
    ));
}

#[tokio::test]
async fn test_removed_listener_leaves_others_firing() {
    let dir = tempfile::tempdir().unwrap();
    let path = path_str(&dir.path().join("hooks.db"));
    let db = Database::new(DatabaseConfig::sqlite(&path));
    db.connect().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let first = {
        let seen = Arc::clone(&seen);
        db.on_after_query(move |_| seen.lock().unwrap().push("first"))
    };
    {
        let seen = Arc::clone(&seen);
        db.on_after_query(move |_| seen.lock().unwrap().push("second"));
    }

    db.query("SELECT 1", &[], false).await.unwrap();
    assert!(db.off_after_query(first));
    db.query("SELECT 1", &[], false).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), ["first", "second", "second"]);
}

#[tokio::test]
async fn test_listeners_see_timing_and_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = path_str(&dir.path().join("events.db"));
    let db = Database::new(DatabaseConfig::sqlite(&path));
    db.connect().await.unwrap();

    let before: Arc<Mutex<Vec<QueryEvent>>> = Arc::default();
    let after: Arc<Mutex<Vec<QueryEvent>>> = Arc::default();
    {
        let before = Arc::clone(&before);
        db.on_before_query(move |e| before.lock().unwrap().push(e.clone()));
        let after = Arc::clone(&after);
        db.on_after_query(move |e| after.lock().unwrap().push(e.clone()));
    }

    db.query("SELECT ?", &[7i64.into()], true).await.unwrap();
    assert!(db.query("SELECT * FROM missing", &[], false).await.is_err());

    let before = before.lock().unwrap();
    let after = after.lock().unwrap();
    assert_eq!(before.len(), 2);
    assert_eq!(after.len(), 2);

    assert_eq!(before[0].sql, "SELECT ?");
    assert!(before[0].is_read);
    assert_eq!(before[0].params.len(), 1);
    assert!(before[0].error.is_none());

    assert!(!after[0].failed());
    assert!(after[1].failed());
    assert!(after[1].error.as_deref().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_transaction_commits_and_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = path_str(&dir.path().join("tx.db"));
    let db = Database::new(DatabaseConfig::sqlite(&path));
    db.connect().await.unwrap();
    db.execute("CREATE TABLE accounts (id INTEGER PRIMARY KEY, balance INTEGER)", &[])
        .await
        .unwrap();
    db.execute("INSERT INTO accounts (id, balance) VALUES (1, 100), (2, 0)", &[])
        .await
        .unwrap();

    db.transaction(|tx| {
        Box::pin(async move {
            tx.execute("UPDATE accounts SET balance = balance - 30 WHERE id = ?", &[1i64.into()])
                .await?;
            tx.execute("UPDATE accounts SET balance = balance + 30 WHERE id = ?", &[2i64.into()])
                .await?;
            Ok(())
        })
    })
    .await
    .unwrap();

    let err = db
        .transaction(|tx| {
            Box::pin(async move {
                tx.execute("UPDATE accounts SET balance = 0 WHERE id = 1", &[])
                    .await?;
                Err::<(), _>(DbError::invalid_input("insufficient funds"))
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));

    let rows = db
        .query("SELECT balance FROM accounts ORDER BY id", &[], false)
        .await
        .unwrap();
    assert_eq!(rows[0]["balance"], 70);
    assert_eq!(rows[1]["balance"], 30);

    let stats = db.pool_stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.waiting, 0);
}

#[tokio::test]
async fn test_pool_stats_cover_replicas() {
    let dir = tempfile::tempdir().unwrap();
    let primary = create_marked_db(&dir, "primary").await;
    let replica = create_marked_db(&dir, "replica").await;

    let db = Database::new(DatabaseConfig::sqlite(&primary).with_read_hosts([replica]));
    db.connect().await.unwrap();
    marker(&db, false).await;
    marker(&db, true).await;

    let stats = db.pool_stats();
    assert_eq!((stats.total, stats.idle, stats.active), (2, 2, 0));

    db.disconnect().await;
    assert_eq!(db.pool_stats().total, 0);
}

#[tokio::test]
async fn test_zero_connection_timeout_is_rejected_at_connect() {
    let dir = tempfile::tempdir().unwrap();
    let path = path_str(&dir.path().join("zero-timeout.db"));
    let db = Database::new(DatabaseConfig::sqlite(&path).with_pooling(PoolOptions {
        connection_timeout_ms: Some(0),
        ..Default::default()
    }));

    let err = db.connect().await.unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
    assert!(!db.is_connected());
}
