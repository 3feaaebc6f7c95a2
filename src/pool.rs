//! Semaphore-bounded connection pool.
//!
//! One pool exists per `host:port:user_agent` key. A counting semaphore with
//! `max_pool_size` permits bounds how many connections are checked out at
//! once; every successful acquire holds exactly one permit until release.
//! Waiting is cooperative: the waiter polls in bounded slices and fails with
//! a pool-timeout error (not a transport error) once the acquisition budget
//! is spent, measured from when the wait began.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;

use crate::config::{ConnectionRequestData, DriverConfig, SessionConfig};
use crate::connection::BoltConnection;
use crate::error::DriverError;
use crate::factory::ConnectionFactory;
use crate::state::ServerState;

/// How long one semaphore wait slice lasts before the elapsed-time checkpoint
/// re-evaluates the deadline.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Counters exposed for logging and tests.
#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    pub idle: usize,
    pub in_use: usize,
    pub total_created: u64,
    pub total_acquisitions: u64,
    pub total_timeouts: u64,
}

/// A connection pool for a single pool key.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    factory: ConnectionFactory,
    request: ConnectionRequestData,
    max_size: usize,
    acquire_timeout: Duration,
    semaphore: Arc<Semaphore>,
    idle: parking_lot::Mutex<Vec<BoltConnection>>,
    in_use: AtomicUsize,
    total_created: AtomicU64,
    total_acquisitions: AtomicU64,
    total_timeouts: AtomicU64,
    closed: AtomicBool,
}

/// A checked-out connection. Holds the semaphore permit for its lifetime;
/// ownership of the guard is what makes "at most one caller per connection"
/// a property of the bookkeeping instead of a convention.
pub struct PooledConnection {
    connection: Option<BoltConnection>,
    permit: Option<OwnedSemaphorePermit>,
    pool: std::sync::Weak<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        factory: ConnectionFactory,
        request: ConnectionRequestData,
        config: &DriverConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                request,
                max_size: config.max_pool_size,
                acquire_timeout: config.acquire_connection_timeout,
                semaphore: Arc::new(Semaphore::new(config.max_pool_size)),
                idle: parking_lot::Mutex::new(Vec::new()),
                in_use: AtomicUsize::new(0),
                total_created: AtomicU64::new(0),
                total_acquisitions: AtomicU64::new(0),
                total_timeouts: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The admission-control identity this pool serves.
    pub fn key(&self) -> String {
        self.inner.request.pool_key()
    }

    /// Acquires a connection: reuse a released one whose identity matches,
    /// otherwise create a fresh one, holding a semaphore permit either way.
    /// Fails with [`DriverError::PoolTimeout`] when no permit arrives within
    /// the configured budget.
    pub async fn acquire(
        &self,
        session: &SessionConfig,
    ) -> Result<PooledConnection, DriverError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(DriverError::PoolClosed);
        }

        let start = Instant::now();
        let deadline = start + inner.acquire_timeout;
        let permit = loop {
            match inner.semaphore.clone().try_acquire_owned() {
                Ok(permit) => break permit,
                Err(TryAcquireError::Closed) => return Err(DriverError::PoolClosed),
                Err(TryAcquireError::NoPermits) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                inner.total_timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    pool = %inner.request.pool_key(),
                    budget = ?inner.acquire_timeout,
                    "connection acquisition timed out"
                );
                return Err(DriverError::PoolTimeout {
                    elapsed: now - start,
                    budget: inner.acquire_timeout,
                });
            }

            // Wait one slice; each checkpoint re-evaluates the deadline and
            // picks up connections released in the meantime.
            let slice = ACQUIRE_POLL_INTERVAL.min(deadline - now);
            match tokio::time::timeout(slice, inner.semaphore.clone().acquire_owned()).await {
                Ok(Ok(permit)) => break permit,
                Ok(Err(_)) => return Err(DriverError::PoolClosed),
                Err(_) => {}
            }
        };

        if inner.closed.load(Ordering::SeqCst) {
            return Err(DriverError::PoolClosed);
        }
        inner.total_acquisitions.fetch_add(1, Ordering::Relaxed);

        if let Some(connection) = self.take_reusable(session).await {
            inner.in_use.fetch_add(1, Ordering::SeqCst);
            return Ok(PooledConnection {
                connection: Some(connection),
                permit: Some(permit),
                pool: Arc::downgrade(inner),
            });
        }

        let connection = inner
            .factory
            .create_connection(&inner.request, session)
            .await?;
        inner.total_created.fetch_add(1, Ordering::Relaxed);
        inner.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(PooledConnection {
            connection: Some(connection),
            permit: Some(permit),
            pool: Arc::downgrade(inner),
        })
    }

    /// Picks a released connection that passes the factory's reuse gate.
    ///
    /// The idle list is shuffled first so reuse spreads across connections.
    /// READY connections are preferred; a STREAMING one (never TX_STREAMING —
    /// a transaction cannot be closed implicitly) is force-drained back to
    /// READY so acquisitions are not starved by unconsumed auto-commit
    /// results. Dead connections found along the way are evicted.
    async fn take_reusable(&self, session: &SessionConfig) -> Option<BoltConnection> {
        let inner = &self.inner;
        let mut evicted = Vec::new();
        let mut streaming: Option<BoltConnection> = None;

        let ready = {
            let mut idle = inner.idle.lock();
            idle.shuffle(&mut rand::thread_rng());

            let mut found = None;
            let mut i = 0;
            while i < idle.len() {
                if !idle[i].is_open() {
                    evicted.push(idle.swap_remove(i));
                    continue;
                }
                let candidate = &idle[i];
                let reusable =
                    inner
                        .factory
                        .can_reuse_connection(candidate, &inner.request, session);
                match candidate.server_state() {
                    ServerState::Ready if reusable => {
                        found = Some(idle.swap_remove(i));
                        break;
                    }
                    ServerState::Streaming if reusable && streaming.is_none() => {
                        streaming = Some(idle.swap_remove(i));
                        continue;
                    }
                    _ => i += 1,
                }
            }
            found
        };

        for connection in evicted {
            connection.close().await;
        }

        if let Some(connection) = ready {
            if let Some(streaming) = streaming {
                inner.idle.lock().push(streaming);
            }
            return Some(inner.factory.reuse_connection(connection, session));
        }

        if let Some(connection) = streaming {
            match connection.consume_results().await {
                Ok(()) if connection.server_state() == ServerState::Ready => {
                    return Some(inner.factory.reuse_connection(connection, session));
                }
                Ok(()) => inner.idle.lock().push(connection),
                Err(e) => {
                    tracing::debug!(error = %e, "draining pooled streaming connection failed");
                    connection.close().await;
                }
            }
        }

        None
    }

    /// Closes the pool: every released connection is torn down and further
    /// acquires fail. Checked-out connections are closed on release.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let drained: Vec<BoltConnection> = self.inner.idle.lock().drain(..).collect();
        for connection in drained {
            connection.close().await;
        }
        tracing::debug!(pool = %self.inner.request.pool_key(), "pool closed");
    }

    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            idle: self.inner.idle.lock().len(),
            in_use: self.inner.in_use.load(Ordering::SeqCst),
            total_created: self.inner.total_created.load(Ordering::Relaxed),
            total_acquisitions: self.inner.total_acquisitions.load(Ordering::Relaxed),
            total_timeouts: self.inner.total_timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub fn in_use_count(&self) -> usize {
        self.inner.in_use.load(Ordering::SeqCst)
    }
}

impl PoolInner {
    /// Takes a connection back. It returns to the idle list in whatever
    /// server state it is in; the next acquire's reuse check is responsible
    /// for rejecting or rescuing non-READY ones.
    async fn return_connection(&self, connection: BoltConnection) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) || !connection.is_open() {
            connection.close().await;
            return;
        }
        let overflow = {
            let mut idle = self.idle.lock();
            if idle.len() >= self.max_size {
                true
            } else {
                idle.push(connection.clone());
                false
            }
        };
        if overflow {
            connection.close().await;
        }
    }
}

impl PooledConnection {
    /// The underlying connection. Clones of it (e.g. inside result streams)
    /// stay valid after release; the pool's drain-on-reuse keeps them
    /// consistent.
    pub fn connection(&self) -> &BoltConnection {
        self.connection.as_ref().expect("connection taken")
    }

    /// Returns the connection to its pool and frees the admission permit.
    pub async fn release(mut self) {
        let connection = self.connection.take().expect("connection taken");
        if let Some(pool) = self.pool.upgrade() {
            pool.return_connection(connection).await;
        } else {
            connection.close().await;
        }
        // Dropping the permit after the connection is back in the idle list
        // lets the unblocked waiter find it there.
        drop(self.permit.take());
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = BoltConnection;

    fn deref(&self) -> &Self::Target {
        self.connection()
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field(
                "connection",
                &self.connection.as_ref().map(|c| c.info().id.clone()),
            )
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            tracing::debug!(
                connection = %connection.info().id,
                "pooled connection dropped without release"
            );
        }
    }
}
