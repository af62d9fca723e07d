//! Bounded connection pool with timed acquisition and crash-safe release
//!
//! State shared between borrowers (idle queue, borrowed count, waiter count,
//! closed flag) sits behind one `std::sync::Mutex` that is never held across
//! an await. Waiters park on a `Notify`; a release wakes one of them.
//! Wake order among waiters is unspecified.
//!
//! Overflow policy decides what a woken waiter does when another borrower
//! got to the queue first:
//!
//! - `Elastic`: open one extra connection beyond `max_connections`
//!   (soft cap; the connection joins the pool on release)
//! - `Strict`: wait again until the acquisition deadline; connections
//!   released while the pool is above capacity are closed

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use nova_core::{DatabaseSection, OverflowPolicy};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use super::{Connector, DbConnection, DriverError, PoolError, PoolResult, Row};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections opened eagerly at construction
    pub max_connections: usize,
    /// How long `acquire` waits for a free connection
    pub acquire_timeout: Duration,
    /// How long opening a single connection may take
    pub connect_timeout: Duration,
    pub overflow: OverflowPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            overflow: OverflowPolicy::Elastic,
        }
    }
}

impl From<&DatabaseSection> for PoolConfig {
    fn from(db: &DatabaseSection) -> Self {
        let timeout = Duration::from_secs(db.connection_timeout);
        Self {
            max_connections: db.max_connections as usize,
            acquire_timeout: timeout,
            connect_timeout: timeout,
            overflow: db.overflow,
        }
    }
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max_connections: usize,
    pub idle: usize,
    pub borrowed: usize,
    /// Connections opened over the pool's lifetime
    pub opened: u64,
    /// Broken connections swapped for fresh ones
    pub replaced: u64,
    /// Connections opened beyond `max_connections`
    pub overflow: u64,
    /// Acquisitions that timed out
    pub exhausted: u64,
    /// Connections dropped without replacement
    pub discarded: u64,
    pub closed: bool,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "borrowed {}, available {}, max {}, opened {}, replaced {}, overflow {}, exhausted {}",
            self.borrowed,
            self.idle,
            self.max_connections,
            self.opened,
            self.replaced,
            self.overflow,
            self.exhausted
        )
    }
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Box<dyn DbConnection>>,
    borrowed: usize,
    waiters: usize,
    closed: bool,
}

enum Checkout {
    Idle(Box<dyn DbConnection>),
    Overflow,
    Wait,
}

#[derive(Debug, Default)]
struct PoolStats {
    opened: AtomicU64,
    replaced: AtomicU64,
    overflow: AtomicU64,
    exhausted: AtomicU64,
    discarded: AtomicU64,
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Notify,
    stats: PoolStats,
}

/// Shared handle to the pool; clones refer to the same connections
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.inner.connector.describe())
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionPool {
    /// Open `max_connections` connections eagerly.
    ///
    /// Any failed open aborts construction; so does ending up with no
    /// connection at all.
    pub async fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> PoolResult<Self> {
        info!(
            target_db = %connector.describe(),
            "Initializing database connection pool with {} connections",
            config.max_connections
        );

        let inner = Arc::new(PoolInner {
            connector,
            config,
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            stats: PoolStats::default(),
        });

        let mut idle = VecDeque::with_capacity(inner.config.max_connections);
        for _ in 0..inner.config.max_connections {
            match inner.open().await {
                Ok(conn) => idle.push_back(conn),
                Err(e) => {
                    error!("Failed to create initial connection: {}", e);
                    return Err(PoolError::Connect(e.to_string()));
                }
            }
        }

        if idle.is_empty() {
            error!("No database connections could be established during initialization");
            return Err(PoolError::Empty);
        }

        inner.lock().idle = idle;
        info!("Database connection pool initialized successfully");
        Ok(Self { inner })
    }

    /// Borrow a connection, run `sql` in a transaction, give the connection back.
    ///
    /// On failure the connection goes through error recovery (kept if it
    /// still answers a ping, replaced otherwise) before the error is
    /// returned.
    pub async fn execute_query(&self, sql: &str) -> PoolResult<Vec<Row>> {
        let mut conn = self.acquire().await?;

        match conn.execute(sql).await {
            Ok(rows) => {
                conn.release().await;
                debug!("Query executed successfully: {}", sql);
                Ok(rows)
            }
            Err(e) => {
                conn.handle_connection_error().await;
                error!("SQL error in query '{}': {}", sql, e);
                Err(PoolError::Query(e.to_string()))
            }
        }
    }

    /// `SELECT 1` round trip; never fails, only reports
    pub async fn health_check(&self) -> bool {
        match self.execute_query("SELECT 1").await {
            Ok(rows) => rows
                .first()
                .and_then(|row| row.get(0))
                .and_then(|value| value.as_i64())
                == Some(1),
            Err(e) => {
                error!("Database health check failed: {}", e);
                false
            }
        }
    }

    /// Wait up to the acquisition timeout for a connection.
    ///
    /// The returned connection is open at hand-off: a broken idle
    /// connection is replaced before it reaches the caller.
    pub async fn acquire(&self) -> PoolResult<PooledConnection> {
        let inner = &self.inner;
        let deadline = Instant::now() + inner.config.acquire_timeout;
        let mut woken = false;

        loop {
            let mut notified = Box::pin(inner.available.notified());
            notified.as_mut().enable();

            let next = {
                let mut state = inner.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                if let Some(conn) = state.idle.pop_front() {
                    state.borrowed += 1;
                    debug!(
                        "Database connection borrowed. Borrowed: {}, Available: {}",
                        state.borrowed,
                        state.idle.len()
                    );
                    Checkout::Idle(conn)
                } else if woken && inner.config.overflow == OverflowPolicy::Elastic {
                    state.borrowed += 1;
                    Checkout::Overflow
                } else {
                    state.waiters += 1;
                    Checkout::Wait
                }
            };

            match next {
                Checkout::Idle(conn) => return self.hand_out(conn).await,
                Checkout::Overflow => return self.open_overflow().await,
                Checkout::Wait => {}
            }

            let timed_out = time::timeout_at(deadline, notified.as_mut())
                .await
                .is_err();

            {
                let mut state = inner.lock();
                state.waiters -= 1;
                // Releases notify under this lock: consume a wake-up that raced
                // the timer and deregister before unlocking, so no permit is
                // left for the next waiter.
                let late_wake = timed_out && notified.as_mut().now_or_never().is_some();
                drop(notified);

                if timed_out && !late_wake && state.idle.is_empty() {
                    drop(state);
                    inner.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Timeout waiting for database connection after {:?}",
                        inner.config.acquire_timeout
                    );
                    return Err(PoolError::Exhausted(inner.config.acquire_timeout));
                }
            }
            woken = true;
        }
    }

    async fn hand_out(&self, conn: Box<dyn DbConnection>) -> PoolResult<PooledConnection> {
        if conn.is_open() {
            return Ok(PooledConnection::new(Arc::clone(&self.inner), conn));
        }

        warn!("Idle database connection is closed, replacing it");
        drop(conn);
        match self.inner.open().await {
            Ok(fresh) => {
                self.inner.stats.replaced.fetch_add(1, Ordering::Relaxed);
                Ok(PooledConnection::new(Arc::clone(&self.inner), fresh))
            }
            Err(e) => {
                self.inner.stats.discarded.fetch_add(1, Ordering::Relaxed);
                self.inner.check_in_ready(None);
                Err(PoolError::Connect(e.to_string()))
            }
        }
    }

    async fn open_overflow(&self) -> PoolResult<PooledConnection> {
        warn!("Connection pool empty after wake-up, opening overflow connection");
        match self.inner.open().await {
            Ok(conn) => {
                self.inner.stats.overflow.fetch_add(1, Ordering::Relaxed);
                Ok(PooledConnection::new(Arc::clone(&self.inner), conn))
            }
            Err(e) => {
                self.inner.check_in_ready(None);
                Err(PoolError::Connect(e.to_string()))
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.lock();
        let stats = &self.inner.stats;
        PoolStatus {
            max_connections: self.inner.config.max_connections,
            idle: state.idle.len(),
            borrowed: state.borrowed,
            opened: stats.opened.load(Ordering::Relaxed),
            replaced: stats.replaced.load(Ordering::Relaxed),
            overflow: stats.overflow.load(Ordering::Relaxed),
            exhausted: stats.exhausted.load(Ordering::Relaxed),
            discarded: stats.discarded.load(Ordering::Relaxed),
            closed: state.closed,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Drain idle connections and wake every waiter.
    ///
    /// Waiters fail with [`PoolError::Closed`]; borrowed connections are
    /// closed when their borrower returns them.
    pub fn close(&self) {
        let drained = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        self.inner.available.notify_waiters();
        drop(drained);
        info!("Database connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn open(&self) -> Result<Box<dyn DbConnection>, DriverError> {
        let conn = time::timeout(self.config.connect_timeout, self.connector.connect())
            .await
            .map_err(|_| {
                DriverError::Connection(format!(
                    "connect timed out after {:?}",
                    self.config.connect_timeout
                ))
            })??;
        self.stats.opened.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    /// Return a borrowed slot, replacing `conn` when it is missing or closed
    async fn check_in(&self, conn: Option<Box<dyn DbConnection>>) {
        let conn = match conn {
            Some(conn) if conn.is_open() => Some(conn),
            _ => match self.open().await {
                Ok(fresh) => {
                    self.stats.replaced.fetch_add(1, Ordering::Relaxed);
                    Some(fresh)
                }
                Err(e) => {
                    self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                    warn!("Invalid connection discarded from pool: {}", e);
                    None
                }
            },
        };
        self.check_in_ready(conn);
    }

    /// Return a borrowed slot with a connection already known to be usable
    fn check_in_ready(&self, conn: Option<Box<dyn DbConnection>>) {
        let mut state = self.lock();
        state.borrowed = state.borrowed.saturating_sub(1);

        if let Some(conn) = conn {
            let live = state.idle.len() + state.borrowed;
            if state.closed {
                drop(conn);
            } else if self.config.overflow == OverflowPolicy::Strict
                && live >= self.config.max_connections
            {
                self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                debug!("Pool above capacity, closing returned connection");
            } else {
                state.idle.push_back(conn);
            }
        }

        debug!(
            "Database connection returned to pool. Borrowed: {}, Available: {}",
            state.borrowed,
            state.idle.len()
        );
        // Only wake when someone is parked; a stored permit would make the
        // next waiter wake up to an empty queue.
        if state.waiters > 0 {
            self.available.notify_one();
        }
    }
}

/// A connection checked out of the pool.
///
/// Return it with [`release`](Self::release) or
/// [`handle_connection_error`](Self::handle_connection_error). Dropping it
/// returns it too: open connections go straight back, closed ones are
/// replaced on a background task.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Box<dyn DbConnection>>,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Box<dyn DbConnection>) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }

    pub fn is_open(&self) -> bool {
        self.conn.as_ref().is_some_and(|conn| conn.is_open())
    }

    pub async fn execute(&mut self, sql: &str) -> Result<Vec<Row>, DriverError> {
        match self.conn.as_mut() {
            Some(conn) => conn.execute(sql).await,
            None => Err(DriverError::Connection(
                "connection already returned to pool".into(),
            )),
        }
    }

    /// Give the connection back; a closed one is replaced transparently
    pub async fn release(mut self) {
        let conn = self.conn.take();
        self.pool.check_in(conn).await;
    }

    /// Error-path release: keep the connection only if it still answers
    pub async fn handle_connection_error(mut self) {
        let conn = match self.conn.take() {
            Some(mut conn) => {
                if conn.is_open() && conn.ping().await {
                    Some(conn)
                } else {
                    None
                }
            }
            None => None,
        };
        self.pool.check_in(conn).await;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if conn.is_open() {
            self.pool.check_in_ready(Some(conn));
            return;
        }

        let pool = Arc::clone(&self.pool);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { pool.check_in(None).await });
            }
            Err(_) => {
                pool.stats.discarded.fetch_add(1, Ordering::Relaxed);
                pool.check_in_ready(None);
            }
        }
    }
}
