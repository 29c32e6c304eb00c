//! Integration tests for the bounded connection pool.
//!
//! A mock connection manager hands out numbered connections so the tests can follow
//! exactly which connection went where. Timing-sensitive tests run on a paused clock.

use async_trait::async_trait;
use sqlgate::DbError;
use sqlgate::db::{ConnectionPool, ManageConnection, PoolConfig, PoolRegistry};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MockManager {
    opened: AtomicUsize,
    closed: AtomicUsize,
    fail: AtomicBool,
    /// Number of upcoming connects that fail before connects succeed again
    fail_next: AtomicUsize,
    connect_delay: Option<Duration>,
}

impl MockManager {
    fn slow(delay: Duration) -> Self {
        Self {
            connect_delay: Some(delay),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ManageConnection for MockManager {
    type Connection = usize;

    async fn connect(&self) -> Result<usize, DbError> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        let fail_once = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail_once || self.fail.load(Ordering::SeqCst) {
            return Err(DbError::connection("refused", "start the server"));
        }
        Ok(self.opened.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn close(&self, _conn: usize) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn config(max: u32, acquire_timeout: Duration) -> PoolConfig {
    PoolConfig {
        max_connections: max,
        min_connections: 0,
        idle_timeout: None,
        acquire_timeout,
    }
}

fn pool(max: u32) -> (Arc<ConnectionPool<MockManager>>, Arc<MockManager>) {
    let manager = Arc::new(MockManager::default());
    let pool = ConnectionPool::new(
        "mock",
        Arc::clone(&manager),
        config(max, Duration::from_secs(5)),
    );
    (pool, manager)
}

/// Yield until `n` callers are queued on the pool.
async fn wait_for_waiters(pool: &ConnectionPool<MockManager>, n: usize) {
    while pool.stats().waiting < n {
        tokio::task::yield_now().await;
    }
}

/// Yield to spawned background work a few times.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_idle_connection_is_reused() {
    let (pool, manager) = pool(2);

    let first = pool.acquire().await.unwrap();
    assert_eq!(*first, 1);
    first.release();

    let again = pool.acquire().await.unwrap();
    assert_eq!(*again, 1);
    assert_eq!(manager.opened.load(Ordering::SeqCst), 1);

    let stats = pool.stats();
    assert_eq!((stats.total, stats.idle, stats.active), (1, 0, 1));
}

#[tokio::test(start_paused = true)]
async fn test_active_connections_never_exceed_max() {
    let (pool, manager) = pool(3);
    let in_use = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let in_use = Arc::clone(&in_use);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                let conn = pool.acquire().await.unwrap();
                let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                assert!(pool.stats().active <= 3);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_use.fetch_sub(1, Ordering::SeqCst);
                drop(conn);
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(manager.opened.load(Ordering::SeqCst), 3);
    let stats = pool.stats();
    assert_eq!((stats.total, stats.idle, stats.waiting), (3, 3, 0));
}

#[tokio::test]
async fn test_waiters_are_served_in_fifo_order() {
    let (pool, _) = pool(1);
    let order = Arc::new(Mutex::new(Vec::new()));
    let held = pool.acquire().await.unwrap();

    let mut tasks = Vec::new();
    for id in 1..=3 {
        let pool_ref = Arc::clone(&pool);
        let order = Arc::clone(&order);
        tasks.push(tokio::spawn(async move {
            let conn = pool_ref.acquire().await.unwrap();
            order.lock().unwrap().push(id);
            drop(conn);
        }));
        wait_for_waiters(&pool, id).await;
    }

    held.release();
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_release_hands_connection_to_waiter_not_idle_set() {
    let (pool, _) = pool(1);
    let held = pool.acquire().await.unwrap();

    let pool_ref = Arc::clone(&pool);
    let waiter = tokio::spawn(async move { pool_ref.acquire().await.map(|c| *c) });
    wait_for_waiters(&pool, 1).await;

    held.release();
    assert_eq!(pool.stats().idle, 0);
    assert_eq!(waiter.await.unwrap().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_times_out_with_pool_exhausted() {
    let manager = Arc::new(MockManager::default());
    let pool = ConnectionPool::new("mock", manager, config(1, Duration::from_millis(100)));
    let _held = pool.acquire().await.unwrap();

    let err = pool.acquire().await.unwrap_err();
    match err {
        DbError::PoolExhausted { pool_key, waited_ms } => {
            assert_eq!(pool_key, "mock");
            assert!(waited_ms >= 100);
        }
        other => panic!("expected PoolExhausted, got {other:?}"),
    }
    assert_eq!(pool.stats().waiting, 0);
}

#[tokio::test(start_paused = true)]
async fn test_settled_waiter_keeps_connection_past_timeout() {
    let manager = Arc::new(MockManager::default());
    let pool = ConnectionPool::new("mock", manager, config(1, Duration::from_millis(100)));
    let held = pool.acquire().await.unwrap();

    let pool_ref = Arc::clone(&pool);
    let waiter = tokio::spawn(async move { pool_ref.acquire().await.map(|c| *c) });
    wait_for_waiters(&pool, 1).await;

    tokio::time::advance(Duration::from_millis(50)).await;
    held.release();
    tokio::time::advance(Duration::from_millis(200)).await;

    assert_eq!(waiter.await.unwrap().unwrap(), 1);
    let stats = pool.stats();
    assert_eq!((stats.total, stats.idle, stats.waiting), (1, 1, 0));
}

#[tokio::test]
async fn test_failed_connect_does_not_leak_slot() {
    let (pool, manager) = pool(1);
    manager.fail.store(true, Ordering::SeqCst);

    let err = pool.acquire().await.unwrap_err();
    assert!(err.is_connection_fatal());
    assert_eq!(pool.stats().total, 0);

    manager.fail.store(false, Ordering::SeqCst);
    let conn = pool.acquire().await.unwrap();
    assert_eq!(*conn, 1);
    assert_eq!(pool.stats().total, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_connect_releases_slot() {
    let manager = Arc::new(MockManager::slow(Duration::from_secs(1)));
    let pool = ConnectionPool::new("mock", manager, config(1, Duration::from_secs(5)));

    let cancelled = tokio::time::timeout(Duration::from_millis(10), pool.acquire()).await;
    assert!(cancelled.is_err());
    assert_eq!(pool.stats().total, 0);
}

#[tokio::test]
async fn test_discard_grows_pool_for_waiter() {
    let (pool, manager) = pool(1);
    let held = pool.acquire().await.unwrap();

    let pool_ref = Arc::clone(&pool);
    let waiter = tokio::spawn(async move { pool_ref.acquire().await.map(|c| *c) });
    wait_for_waiters(&pool, 1).await;

    held.discard();
    assert_eq!(waiter.await.unwrap().unwrap(), 2);
    settle().await;
    assert_eq!(manager.closed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().total, 1);
}

#[tokio::test]
async fn test_grow_failure_goes_to_oldest_waiter_only() {
    let (pool, manager) = pool(1);
    let held = pool.acquire().await.unwrap();

    let first = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire().await.map(|c| *c) })
    };
    wait_for_waiters(&pool, 1).await;
    let second = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire().await.map(|c| *c) })
    };
    wait_for_waiters(&pool, 2).await;

    manager.fail_next.store(1, Ordering::SeqCst);
    held.discard();

    let err = first.await.unwrap().unwrap_err();
    assert!(matches!(err, DbError::Connection { .. }));

    // The pool grows again for the next waiter without any further acquire or release
    assert_eq!(second.await.unwrap().unwrap(), 2);
    let stats = pool.stats();
    assert_eq!((stats.total, stats.idle, stats.waiting), (1, 1, 0));
}

#[tokio::test(start_paused = true)]
async fn test_waiters_keep_fifo_order_across_grow_failure() {
    let (pool, manager) = pool(1);
    let held = pool.acquire().await.unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let spawn_waiter = |name: &'static str| {
        let pool = Arc::clone(&pool);
        let order = Arc::clone(&order);
        tokio::spawn(async move {
            let result = pool.acquire().await.map(|c| *c);
            order.lock().unwrap().push(name);
            result
        })
    };

    let first = spawn_waiter("first");
    wait_for_waiters(&pool, 1).await;
    let second = spawn_waiter("second");
    wait_for_waiters(&pool, 2).await;

    manager.fail_next.store(1, Ordering::SeqCst);
    held.discard();
    let newcomer = spawn_waiter("newcomer");

    assert!(first.await.unwrap().is_err());
    // A stranded waiter would run into the acquire timeout on the paused clock
    assert_eq!(second.await.unwrap().unwrap(), 2);
    assert_eq!(newcomer.await.unwrap().unwrap(), 2);
    assert_eq!(*order.lock().unwrap(), ["first", "second", "newcomer"]);
    assert_eq!(manager.opened.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_grow_after_waiter_served_frees_slot() {
    let (pool, manager) = pool(2);
    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire().await.map(|c| *c) })
    };
    wait_for_waiters(&pool, 1).await;

    // The discard starts a grow for the waiter, the release serves it first
    manager.fail_next.store(1, Ordering::SeqCst);
    a.discard();
    b.release();

    assert_eq!(waiter.await.unwrap().unwrap(), 2);
    settle().await;
    let stats = pool.stats();
    assert_eq!((stats.total, stats.waiting), (1, 0));
}

#[tokio::test]
async fn test_drain_closes_idle_and_later_released_connections() {
    let (pool, manager) = pool(2);
    let idle = pool.acquire().await.unwrap();
    let held = pool.acquire().await.unwrap();
    idle.release();

    pool.drain().await;
    assert_eq!(manager.closed.load(Ordering::SeqCst), 1);
    assert!(matches!(
        pool.acquire().await.unwrap_err(),
        DbError::PoolClosed { .. }
    ));

    held.release();
    settle().await;
    assert_eq!(pool.stats().total, 0);
    assert_eq!(manager.closed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_drain_rejects_pending_waiters() {
    let (pool, _) = pool(1);
    let _held = pool.acquire().await.unwrap();

    let pool_ref = Arc::clone(&pool);
    let waiter = tokio::spawn(async move { pool_ref.acquire().await.map(|c| *c) });
    wait_for_waiters(&pool, 1).await;

    pool.drain().await;
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, DbError::PoolClosed { .. }));
}

#[tokio::test]
async fn test_dropped_guard_returns_connection() {
    let (pool, _) = pool(1);
    {
        let _conn = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().active, 1);
    }
    let stats = pool.stats();
    assert_eq!((stats.total, stats.idle, stats.active), (1, 1, 0));
}

#[tokio::test]
async fn test_discard_on_drop_closes_connection() {
    let (pool, manager) = pool(1);
    {
        let mut conn = pool.acquire().await.unwrap();
        conn.set_discard_on_drop(true);
    }
    settle().await;
    assert_eq!(pool.stats().total, 0);
    assert_eq!(manager.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reaper_closes_expired_idle_connections() {
    let manager = Arc::new(MockManager::default());
    let pool = ConnectionPool::new(
        "mock",
        Arc::clone(&manager),
        PoolConfig {
            idle_timeout: Some(Duration::from_secs(1)),
            ..config(2, Duration::from_secs(5))
        },
    );
    pool.acquire().await.unwrap().release();
    assert_eq!(pool.stats().idle, 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    settle().await;
    assert_eq!(pool.stats().total, 0);
    assert_eq!(manager.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_warm_opens_min_and_reaper_keeps_them() {
    let manager = Arc::new(MockManager::default());
    let pool = ConnectionPool::new(
        "mock",
        Arc::clone(&manager),
        PoolConfig {
            min_connections: 2,
            idle_timeout: Some(Duration::from_secs(1)),
            ..config(4, Duration::from_secs(5))
        },
    );
    pool.warm().await.unwrap();
    assert_eq!(pool.stats().idle, 2);

    tokio::time::sleep(Duration::from_secs(3)).await;
    settle().await;
    assert_eq!(pool.stats().total, 2);
    assert_eq!(manager.closed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_error_handler_receives_background_failures() {
    let (pool, manager) = pool(1);
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);
    pool.set_error_handler(Arc::new(move |key, err| {
        sink.lock().unwrap().push(format!("{key}: {err}"));
    }));

    let held = pool.acquire().await.unwrap();
    let pool_ref = Arc::clone(&pool);
    let waiter = tokio::spawn(async move { pool_ref.acquire().await.map(|c| *c) });
    wait_for_waiters(&pool, 1).await;

    manager.fail.store(true, Ordering::SeqCst);
    held.discard();
    assert!(waiter.await.unwrap().is_err());

    let reported = reported.lock().unwrap();
    assert_eq!(reported.len(), 1);
    assert!(reported[0].starts_with("mock: "));
}

#[tokio::test]
async fn test_registry_shares_pool_by_key() {
    let registry: Arc<PoolRegistry<MockManager>> = PoolRegistry::new();
    let manager = Arc::new(MockManager::default());
    let cfg = config(2, Duration::from_secs(1));

    let (a, created_a) = registry.get_or_create("db:5432/app", &cfg, Arc::clone(&manager));
    let (b, created_b) = registry.get_or_create("db:5432/app", &cfg, Arc::clone(&manager));
    let (c, _) = registry.get_or_create("db:5432/other", &cfg, Arc::clone(&manager));
    assert!(created_a && !created_b);
    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));

    let conn = registry.acquire("db:5432/app").await.unwrap();
    assert_eq!(registry.stats(Some("db:5432/app")).active, 1);
    assert_eq!(registry.stats(None).total, 1);
    drop(conn);

    assert!(matches!(
        registry.acquire("missing").await.unwrap_err(),
        DbError::NotConnected { .. }
    ));
    assert_eq!(registry.keys(), vec!["db:5432/app", "db:5432/other"]);
}

#[tokio::test]
async fn test_registry_drains_shared_pool_on_last_detach() {
    let registry: Arc<PoolRegistry<MockManager>> = PoolRegistry::new();
    let manager = Arc::new(MockManager::default());
    let cfg = config(2, Duration::from_secs(1));

    let (pool, _) = registry.attach("shared", &cfg, Arc::clone(&manager));
    registry.attach("shared", &cfg, Arc::clone(&manager));

    registry.detach("shared").await;
    assert!(!pool.is_closed());
    registry.detach("shared").await;
    assert!(pool.is_closed());
}
