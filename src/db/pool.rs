//! Bounded connection pool with FIFO waiters.
//!
//! A [`ConnectionPool`] owns the physical connections for one pool key. Callers obtain a
//! [`PooledConnection`] guard from [`ConnectionPool::acquire`]; dropping or releasing the
//! guard returns the connection, handing it straight to the oldest waiter when one exists.
//!
//! # Concurrency Safety
//!
//! - All pool state lives behind one `std::sync::Mutex` that is never held across an await
//! - Handing a connection to a waiter (pop + send) happens inside a single critical section
//! - A waiter is settled exactly once: whichever of release or timeout removes it from the
//!   queue first wins, the other path observes the removal
//! - Connect attempts reserve a slot up front; the reservation is rolled back on failure
//!   and when the acquiring future is dropped mid-connect
//!
//! Background work (closing connections, growing the pool for a waiter) runs on spawned
//! tasks and is reported through the optional error handler rather than returned.

use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lower bound for the reaper tick so tiny idle timeouts do not spin.
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(100);

/// Opens and closes physical connections for a pool.
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> DbResult<Self::Connection>;

    async fn close(&self, conn: Self::Connection);
}

/// Resolved pool limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on live connections (idle + active), at least 1
    pub max_connections: u32,
    /// Connections opened by [`ConnectionPool::warm`] and kept by the reaper
    pub min_connections: u32,
    /// Idle connections older than this are closed; `None` keeps them forever
    pub idle_timeout: Option<Duration>,
    /// How long `acquire` waits for a free connection (and for a physical connect)
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: crate::config::DEFAULT_MAX_CONNECTIONS,
            min_connections: crate::config::DEFAULT_MIN_CONNECTIONS,
            idle_timeout: Some(Duration::from_millis(crate::config::DEFAULT_IDLE_TIMEOUT_MS)),
            acquire_timeout: Duration::from_millis(crate::config::DEFAULT_ACQUIRE_TIMEOUT_MS),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> DbResult<()> {
        if self.max_connections == 0 {
            return Err(DbError::invalid_input("max_connections must be at least 1"));
        }
        if self.min_connections > self.max_connections {
            return Err(DbError::invalid_input(format!(
                "min_connections ({}) cannot exceed max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.acquire_timeout.is_zero() {
            return Err(DbError::invalid_input("acquire_timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub waiting: usize,
}

impl std::ops::Add for PoolStats {
    type Output = PoolStats;

    fn add(self, rhs: PoolStats) -> PoolStats {
        PoolStats {
            total: self.total + rhs.total,
            idle: self.idle + rhs.idle,
            active: self.active + rhs.active,
            waiting: self.waiting + rhs.waiting,
        }
    }
}

impl std::iter::Sum for PoolStats {
    fn sum<I: Iterator<Item = PoolStats>>(iter: I) -> Self {
        iter.fold(PoolStats::default(), |acc, s| acc + s)
    }
}

/// Callback for background pool failures: `(pool_key, error)`.
pub type ErrorHandler = Arc<dyn Fn(&str, &DbError) + Send + Sync>;

type Settlement<M> = DbResult<PooledConnection<M>>;

struct IdleConnection<C> {
    conn: C,
    idle_since: Instant,
}

struct Waiter<M: ManageConnection> {
    id: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<Settlement<M>>,
}

struct PoolState<M: ManageConnection> {
    idle: VecDeque<IdleConnection<M::Connection>>,
    /// Idle + active + reserved for an in-flight connect
    live: u32,
    waiters: VecDeque<Waiter<M>>,
    next_waiter_id: u64,
    closed: bool,
}

enum Step<M: ManageConnection> {
    Ready(M::Connection),
    Connect,
    Wait(u64, oneshot::Receiver<Settlement<M>>),
}

/// Connection pool for a single pool key.
pub struct ConnectionPool<M: ManageConnection> {
    key: String,
    config: PoolConfig,
    manager: Arc<M>,
    state: Mutex<PoolState<M>>,
    error_handler: RwLock<Option<ErrorHandler>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl<M: ManageConnection> ConnectionPool<M> {
    /// Create an empty pool. No connection is opened until [`acquire`](Self::acquire)
    /// or [`warm`](Self::warm).
    ///
    /// When an idle timeout is configured and a tokio runtime is available, a reaper task
    /// holding a weak reference closes expired idle connections.
    pub fn new(key: impl Into<String>, manager: Arc<M>, config: PoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            key: key.into(),
            config,
            manager,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                live: 0,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
                closed: false,
            }),
            error_handler: RwLock::new(None),
            reaper: Mutex::new(None),
        });

        if let (Some(idle_timeout), Ok(handle)) = (
            pool.config.idle_timeout,
            tokio::runtime::Handle::try_current(),
        ) {
            let weak = Arc::downgrade(&pool);
            let interval = (idle_timeout / 2).max(MIN_REAP_INTERVAL);
            let task = handle.spawn(Self::reaper_task(weak, interval));
            *pool.lock_reaper() = Some(task);
        }

        debug!(pool_key = %pool.key, max = pool.config.max_connections, "Created connection pool");
        pool
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<M> {
        &self.manager
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Register the handler that receives background failures.
    pub fn set_error_handler(&self, handler: ErrorHandler) {
        let mut slot = self
            .error_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(handler);
    }

    /// Acquire a connection.
    ///
    /// Returns an idle connection without suspending when one exists. Below capacity a
    /// new connection is opened. At capacity the caller queues behind earlier waiters
    /// and fails with [`DbError::PoolExhausted`] once `acquire_timeout` elapses.
    pub async fn acquire(self: &Arc<Self>) -> DbResult<PooledConnection<M>> {
        let started = Instant::now();
        let (step, expired) = self.plan_acquire(started)?;
        self.close_in_background(expired);

        match step {
            Step::Ready(conn) => {
                debug!(pool_key = %self.key, "Reusing idle connection");
                Ok(PooledConnection::new(Arc::clone(self), conn))
            }
            Step::Connect => self.connect_reserved().await,
            Step::Wait(id, rx) => self.wait_for_release(id, rx, started).await,
        }
    }

    fn plan_acquire(&self, now: Instant) -> DbResult<(Step<M>, Vec<M::Connection>)> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(DbError::pool_closed(&self.key));
        }

        let mut expired = Vec::new();
        while let Some(idle) = state.idle.pop_back() {
            if self.is_expired(&idle, now) {
                state.live -= 1;
                expired.push(idle.conn);
                continue;
            }
            return Ok((Step::Ready(idle.conn), expired));
        }

        // Queued callers keep their place; a newcomer never connects ahead of them
        let queued = state.waiters.iter().any(|w| !w.tx.is_closed());
        if !queued && state.live < self.config.max_connections {
            state.live += 1;
            return Ok((Step::Connect, expired));
        }

        let (tx, rx) = oneshot::channel();
        let id = state.next_waiter_id;
        state.next_waiter_id += 1;
        state.waiters.push_back(Waiter {
            id,
            enqueued_at: now,
            tx,
        });
        debug!(
            pool_key = %self.key,
            waiter_id = id,
            waiting = state.waiters.len(),
            "Pool at capacity, queueing waiter"
        );
        Ok((Step::Wait(id, rx), expired))
    }

    /// Open a connection into a slot already counted in `live`.
    async fn connect_reserved(self: &Arc<Self>) -> DbResult<PooledConnection<M>> {
        let mut slot = SlotReservation::new(Arc::clone(self));
        let conn = self.open().await?;
        slot.commit();

        if self.lock_state().closed {
            self.release(conn);
            return Err(DbError::pool_closed(&self.key));
        }
        debug!(pool_key = %self.key, "Opened new connection");
        Ok(PooledConnection::new(Arc::clone(self), conn))
    }

    async fn wait_for_release(
        &self,
        id: u64,
        mut rx: oneshot::Receiver<Settlement<M>>,
        started: Instant,
    ) -> DbResult<PooledConnection<M>> {
        match tokio::time::timeout(self.config.acquire_timeout, &mut rx).await {
            Ok(Ok(settled)) => settled,
            // Sender dropped without settling: the pool state went away
            Ok(Err(_)) => Err(DbError::pool_closed(&self.key)),
            Err(_) => {
                let still_queued = {
                    let mut state = self.lock_state();
                    match state.waiters.iter().position(|w| w.id == id) {
                        Some(pos) => {
                            state.waiters.remove(pos);
                            true
                        }
                        None => false,
                    }
                };

                let waited_ms = started.elapsed().as_millis() as u64;
                if still_queued {
                    debug!(pool_key = %self.key, waiter_id = id, waited_ms, "Acquire timed out");
                    return Err(DbError::pool_exhausted(&self.key, waited_ms));
                }

                // Settled under the lock before we got there; the value is already sent.
                match rx.try_recv() {
                    Ok(settled) => settled,
                    Err(_) => Err(DbError::pool_exhausted(&self.key, waited_ms)),
                }
            }
        }
    }

    /// Return a connection. The oldest live waiter receives it directly; otherwise it
    /// becomes idle. After [`drain`](Self::drain) the connection is closed instead.
    pub(crate) fn release(self: &Arc<Self>, conn: M::Connection) {
        let mut state = self.lock_state();
        if state.closed {
            state.live = state.live.saturating_sub(1);
            drop(state);
            self.close_in_background(vec![conn]);
            return;
        }

        let mut conn = conn;
        while let Some(waiter) = state.waiters.pop_front() {
            let guard = PooledConnection::new(Arc::clone(self), conn);
            match waiter.tx.send(Ok(guard)) {
                Ok(()) => {
                    debug!(
                        pool_key = %self.key,
                        waiter_id = waiter.id,
                        waited_ms = waiter.enqueued_at.elapsed().as_millis() as u64,
                        "Handed connection to waiter"
                    );
                    return;
                }
                // Waiter's caller went away; take the connection back and try the next one
                Err(returned) => match returned.ok().and_then(PooledConnection::into_inner) {
                    Some(back) => conn = back,
                    None => return,
                },
            }
        }

        state.idle.push_back(IdleConnection {
            conn,
            idle_since: Instant::now(),
        });
    }

    /// Close a connection instead of returning it, freeing its slot.
    ///
    /// If callers are waiting, the pool grows on their behalf in the background.
    pub(crate) fn discard(self: &Arc<Self>, conn: M::Connection) {
        let grow = {
            let mut state = self.lock_state();
            state.live = state.live.saturating_sub(1);
            self.reserve_for_waiter(&mut state)
        };
        debug!(pool_key = %self.key, "Discarded connection");
        self.close_in_background(vec![conn]);
        if grow {
            self.spawn_grow_for_waiter();
        }
    }

    fn free_slot(self: &Arc<Self>) {
        let grow = {
            let mut state = self.lock_state();
            state.live = state.live.saturating_sub(1);
            self.reserve_for_waiter(&mut state)
        };
        if grow {
            self.spawn_grow_for_waiter();
        }
    }

    /// Reserve a slot when a waiter could use one. Caller spawns the grow task.
    fn reserve_for_waiter(&self, state: &mut PoolState<M>) -> bool {
        let has_waiters = state.waiters.iter().any(|w| !w.tx.is_closed());
        if !state.closed && has_waiters && state.live < self.config.max_connections {
            state.live += 1;
            true
        } else {
            false
        }
    }

    fn spawn_grow_for_waiter(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let spawned = spawn_background(async move { pool.grow_for_waiter().await });
        if !spawned {
            let mut state = self.lock_state();
            state.live = state.live.saturating_sub(1);
        }
    }

    async fn grow_for_waiter(self: Arc<Self>) {
        match self.open().await {
            Ok(conn) => {
                debug!(pool_key = %self.key, "Opened connection for waiter");
                self.release(conn);
            }
            Err(e) => {
                self.report(&e);
                let grow_again = {
                    let mut state = self.lock_state();
                    state.live = state.live.saturating_sub(1);

                    // The failure reaches the oldest waiter only
                    let mut err = e;
                    while let Some(waiter) = state.waiters.pop_front() {
                        match waiter.tx.send(Err(err)) {
                            Err(Err(back)) => err = back,
                            _ => break,
                        }
                    }
                    self.reserve_for_waiter(&mut state)
                };
                if grow_again {
                    self.spawn_grow_for_waiter();
                }
            }
        }
    }

    async fn open(&self) -> DbResult<M::Connection> {
        match tokio::time::timeout(self.config.acquire_timeout, self.manager.connect()).await {
            Ok(result) => result,
            Err(_) => Err(DbError::connection(
                format!(
                    "Timed out after {}ms opening a connection for '{}'",
                    self.config.acquire_timeout.as_millis(),
                    self.key
                ),
                "Check that the database server is reachable",
            )),
        }
    }

    /// Pre-open connections until `min_connections` are live.
    pub async fn warm(self: &Arc<Self>) -> DbResult<()> {
        loop {
            {
                let mut state = self.lock_state();
                if state.closed || state.live >= self.config.min_connections {
                    return Ok(());
                }
                state.live += 1;
            }
            let mut slot = SlotReservation::new(Arc::clone(self));
            let conn = self.open().await?;
            slot.commit();
            self.release(conn);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        let total = state.live as usize;
        let idle = state.idle.len();
        PoolStats {
            total,
            idle,
            active: total.saturating_sub(idle),
            waiting: state.waiters.iter().filter(|w| !w.tx.is_closed()).count(),
        }
    }

    /// Close idle connections past the idle timeout, keeping `min_connections` live.
    ///
    /// Returns the number of connections closed.
    pub async fn reap_idle(&self) -> usize {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return 0;
        };

        let expired: Vec<M::Connection> = {
            let mut state = self.lock_state();
            let now = Instant::now();
            let mut expired = Vec::new();
            // Oldest idle connections sit at the front
            while state.live > self.config.min_connections {
                match state.idle.front() {
                    Some(idle) if now.duration_since(idle.idle_since) >= idle_timeout => {
                        if let Some(idle) = state.idle.pop_front() {
                            state.live -= 1;
                            expired.push(idle.conn);
                        }
                    }
                    _ => break,
                }
            }
            expired
        };

        let count = expired.len();
        for conn in expired {
            self.manager.close(conn).await;
        }
        if count > 0 {
            debug!(pool_key = %self.key, closed = count, "Reaped idle connections");
        }
        count
    }

    async fn reaper_task(weak: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(pool) = weak.upgrade() else {
                return;
            };
            if pool.is_closed() {
                return;
            }
            pool.reap_idle().await;
        }
    }

    /// Shut the pool down.
    ///
    /// Idle connections are closed now, pending waiters fail with
    /// [`DbError::PoolClosed`], and active connections are closed when released.
    pub async fn drain(&self) {
        let (idle, waiters) = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).map(|i| i.conn).collect();
            state.live = state.live.saturating_sub(idle.len() as u32);
            let waiters: Vec<_> = state.waiters.drain(..).collect();
            (idle, waiters)
        };

        if let Some(task) = self.lock_reaper().take() {
            task.abort();
        }

        let rejected = waiters.len();
        for waiter in waiters {
            let _ = waiter.tx.send(Err(DbError::pool_closed(&self.key)));
        }

        let closed = idle.len();
        for conn in idle {
            self.manager.close(conn).await;
        }
        info!(pool_key = %self.key, closed, rejected, "Drained connection pool");
    }

    fn is_expired(&self, idle: &IdleConnection<M::Connection>, now: Instant) -> bool {
        self.config
            .idle_timeout
            .is_some_and(|timeout| now.duration_since(idle.idle_since) >= timeout)
    }

    fn close_in_background(&self, conns: Vec<M::Connection>) {
        if conns.is_empty() {
            return;
        }
        let manager = Arc::clone(&self.manager);
        spawn_background(async move {
            for conn in conns {
                manager.close(conn).await;
            }
        });
    }

    fn report(&self, err: &DbError) {
        warn!(pool_key = %self.key, error = %err, "Background pool error");
        let handler = self
            .error_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(&self.key, err);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<M>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_reaper(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reaper.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<M: ManageConnection> Drop for ConnectionPool<M> {
    fn drop(&mut self) {
        if let Some(task) = self.lock_reaper().take() {
            task.abort();
        }
    }
}

impl<M: ManageConnection> std::fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("key", &self.key)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Spawn onto the current runtime if there is one. Returns `false` when no runtime is
/// available, in which case the future is dropped.
fn spawn_background<F>(fut: F) -> bool
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(fut);
            true
        }
        Err(_) => false,
    }
}

/// A slot counted in `live` for a connect that has not completed yet.
/// Dropping it without [`commit`](Self::commit) gives the slot back.
struct SlotReservation<M: ManageConnection> {
    pool: Arc<ConnectionPool<M>>,
    armed: bool,
}

impl<M: ManageConnection> SlotReservation<M> {
    fn new(pool: Arc<ConnectionPool<M>>) -> Self {
        Self { pool, armed: true }
    }

    fn commit(&mut self) {
        self.armed = false;
    }
}

impl<M: ManageConnection> Drop for SlotReservation<M> {
    fn drop(&mut self) {
        if self.armed {
            debug!(pool_key = %self.pool.key, "Connect failed, releasing reserved slot");
            self.pool.free_slot();
        }
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dropping the guard returns the connection to its pool. Use
/// [`discard`](Self::discard) for connections that must not be reused.
pub struct PooledConnection<M: ManageConnection> {
    pool: Arc<ConnectionPool<M>>,
    conn: Option<M::Connection>,
    discard_on_drop: bool,
}

impl<M: ManageConnection> PooledConnection<M> {
    fn new(pool: Arc<ConnectionPool<M>>, conn: M::Connection) -> Self {
        Self {
            pool,
            conn: Some(conn),
            discard_on_drop: false,
        }
    }

    fn into_inner(mut self) -> Option<M::Connection> {
        self.conn.take()
    }

    pub fn pool_key(&self) -> &str {
        &self.pool.key
    }

    /// Make dropping the guard discard the connection instead of returning it.
    ///
    /// Set while the connection is in a state the next user must not see, such as an
    /// open transaction or an in-flight statement. Explicit [`release`](Self::release)
    /// still returns the connection.
    pub fn set_discard_on_drop(&mut self, discard: bool) {
        self.discard_on_drop = discard;
    }

    /// Return the connection to the pool.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }

    /// Close the connection and free its slot.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
    }
}

impl<M: ManageConnection> std::ops::Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("pooled connection used after being returned")
    }
}

impl<M: ManageConnection> std::ops::DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("pooled connection used after being returned")
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.discard_on_drop {
                warn!(pool_key = %self.pool.key, "Connection dropped mid-operation, discarding");
                self.pool.discard(conn);
            } else {
                self.pool.release(conn);
            }
        }
    }
}

impl<M: ManageConnection> std::fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool_key", &self.pool.key)
            .field("held", &self.conn.is_some())
            .finish()
    }
}
