//! Sessions: the unit of work sequencing against acquired connections.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bookmark::{Bookmark, BookmarkHolder};
use crate::codec::TransactionExtra;
use crate::config::{AccessMode, DriverConfig, SessionConfig, TransactionConfig};
use crate::error::DriverError;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::result::BoltResult;
use crate::routing::RoutedPools;
use crate::transaction::UnmanagedTransaction;
use crate::value::Dict;

/// The client never times out before the server does: the socket deadline is
/// floored at this value plus a margin, so the server's own `tx_timeout`
/// error stays authoritative.
const MIN_SOCKET_TIMEOUT: Duration = Duration::from_secs(30);
const SOCKET_TIMEOUT_MARGIN: Duration = Duration::from_secs(2);

/// The future a transaction closure returns. Boxed so closures can borrow
/// the transaction across awaits.
pub type TxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DriverError>> + Send + 'a>>;

/// One query with its parameters.
#[derive(Debug, Clone)]
pub struct Statement {
    pub text: String,
    pub parameters: Dict,
}

impl Statement {
    pub fn new(text: impl Into<String>, parameters: Dict) -> Self {
        Self {
            text: text.into(),
            parameters,
        }
    }
}

/// Where a session gets its connections from: a single-server pool or the
/// routed per-member pools.
#[derive(Clone)]
pub(crate) enum SessionPool {
    Direct(ConnectionPool),
    Routed(Arc<RoutedPools>),
}

impl SessionPool {
    async fn acquire(
        &self,
        config: &SessionConfig,
        bookmarks: Vec<String>,
    ) -> Result<PooledConnection, DriverError> {
        match self {
            Self::Direct(pool) => pool.acquire(config).await,
            Self::Routed(routed) => routed.acquire(config, bookmarks).await,
        }
    }
}

/// A session. Cheap to create; connections are only acquired per unit of
/// work. Sessions sharing a [`BookmarkHolder`] observe each other's writes.
pub struct Session {
    config: SessionConfig,
    driver_config: DriverConfig,
    pool: SessionPool,
    bookmarks: BookmarkHolder,
}

impl Session {
    pub(crate) fn new(
        config: SessionConfig,
        driver_config: DriverConfig,
        pool: SessionPool,
    ) -> Self {
        let bookmarks = BookmarkHolder::new(config.bookmarks.clone());
        Self {
            config,
            driver_config,
            pool,
            bookmarks,
        }
    }

    /// The session's current causal-consistency tokens.
    pub fn last_bookmarks(&self) -> Bookmark {
        self.bookmarks.current()
    }

    pub fn bookmark_holder(&self) -> &BookmarkHolder {
        &self.bookmarks
    }

    fn fetch_size(&self) -> i64 {
        self.config.fetch_size.unwrap_or(self.driver_config.fetch_size)
    }

    /// Runs an auto-commit query and returns its lazy result. The connection
    /// goes back to the pool immediately — the stream keeps pulling through
    /// it, and the pool's drain-on-reuse keeps later acquirers consistent.
    pub async fn run(&self, query: &str, parameters: Dict) -> Result<BoltResult, DriverError> {
        self.run_statement(Statement::new(query, parameters)).await
    }

    pub async fn run_statement(&self, statement: Statement) -> Result<BoltResult, DriverError> {
        let bookmarks = self.bookmarks.current().values();
        let connection = self.pool.acquire(&self.config, bookmarks.clone()).await?;

        let extra = TransactionExtra {
            database: self.config.database.clone(),
            tx_timeout: None,
            bookmarks,
            mode: Some(self.config.access_mode),
            tx_metadata: None,
            impersonated_user: self.config.impersonated_user.clone(),
        };

        match connection
            .run(&statement.text, statement.parameters, &extra)
            .await
        {
            Ok(metadata) => {
                let result = BoltResult::subscribe(
                    connection.connection().clone(),
                    metadata,
                    self.fetch_size(),
                    Some(self.bookmarks.clone()),
                )
                .await;
                connection.release().await;
                Ok(result)
            }
            Err(e) => {
                self.reset_if_required(&connection, &e).await;
                connection.release().await;
                Err(e)
            }
        }
    }

    /// Runs several statements sequentially on this session.
    pub async fn run_statements(
        &self,
        statements: Vec<Statement>,
    ) -> Result<Vec<BoltResult>, DriverError> {
        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            results.push(self.run_statement(statement).await?);
        }
        Ok(results)
    }

    /// Begins an explicit transaction using the session's access mode.
    pub async fn begin_transaction(
        &self,
        config: TransactionConfig,
    ) -> Result<UnmanagedTransaction, DriverError> {
        self.begin_transaction_with_mode(self.config.access_mode, config)
            .await
    }

    async fn begin_transaction_with_mode(
        &self,
        mode: AccessMode,
        tx_config: TransactionConfig,
    ) -> Result<UnmanagedTransaction, DriverError> {
        let mut session_config = self.config.clone();
        session_config.access_mode = mode;

        let bookmarks = self.bookmarks.current().values();
        let connection = self
            .pool
            .acquire(&session_config, bookmarks.clone())
            .await?;

        if let Some(timeout) = tx_config.timeout {
            let socket_deadline = timeout.max(MIN_SOCKET_TIMEOUT) + SOCKET_TIMEOUT_MARGIN;
            connection.set_timeout(Some(socket_deadline)).await;
        }

        let extra = TransactionExtra {
            database: session_config.database.clone(),
            tx_timeout: tx_config.timeout,
            bookmarks,
            mode: Some(mode),
            tx_metadata: tx_config.metadata.clone(),
            impersonated_user: session_config.impersonated_user.clone(),
        };

        match connection.begin(&extra).await {
            Ok(()) => Ok(UnmanagedTransaction::new(
                connection,
                self.bookmarks.clone(),
                &session_config,
                self.fetch_size(),
            )),
            Err(e) => {
                self.reset_if_required(&connection, &e).await;
                connection.release().await;
                Err(e)
            }
        }
    }

    /// Runs `work` in a transaction with the session's access mode, retrying
    /// retryable failures on a fresh transaction. The closure may execute
    /// more than once and must be idempotent.
    pub async fn transaction<T, F>(
        &self,
        work: F,
        config: TransactionConfig,
    ) -> Result<T, DriverError>
    where
        F: for<'a> FnMut(&'a mut UnmanagedTransaction) -> TxFuture<'a, T>,
    {
        self.retry(self.config.access_mode, work, config).await
    }

    /// Like [`Session::transaction`], pinned to WRITE routing.
    pub async fn write_transaction<T, F>(
        &self,
        work: F,
        config: TransactionConfig,
    ) -> Result<T, DriverError>
    where
        F: for<'a> FnMut(&'a mut UnmanagedTransaction) -> TxFuture<'a, T>,
    {
        self.retry(AccessMode::Write, work, config).await
    }

    /// Like [`Session::transaction`], pinned to READ routing.
    pub async fn read_transaction<T, F>(
        &self,
        work: F,
        config: TransactionConfig,
    ) -> Result<T, DriverError>
    where
        F: for<'a> FnMut(&'a mut UnmanagedTransaction) -> TxFuture<'a, T>,
    {
        self.retry(AccessMode::Read, work, config).await
    }

    async fn retry<T, F>(
        &self,
        mode: AccessMode,
        mut work: F,
        config: TransactionConfig,
    ) -> Result<T, DriverError>
    where
        F: for<'a> FnMut(&'a mut UnmanagedTransaction) -> TxFuture<'a, T>,
    {
        let deadline = Instant::now() + self.driver_config.max_retry_time;
        loop {
            let mut tx = self
                .begin_transaction_with_mode(mode, config.clone())
                .await?;
            match work(&mut tx).await {
                Ok(value) => match tx.commit().await {
                    Ok(()) => return Ok(value),
                    Err(e) if e.is_retryable() && Instant::now() < deadline => {
                        tracing::debug!(error = %e, "commit failed, retrying unit of work");
                    }
                    Err(e) => return Err(e),
                },
                Err(e) => {
                    if !tx.is_finished() {
                        if let Err(rollback_err) = tx.rollback().await {
                            tracing::debug!(error = %rollback_err, "rollback after failure failed");
                        }
                    }
                    if e.is_retryable() && Instant::now() < deadline {
                        tracing::debug!(error = %e, "retrying unit of work");
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn reset_if_required(&self, connection: &PooledConnection, error: &DriverError) {
        let needs_reset = match error {
            DriverError::Server(server) => server.requires_reset(),
            DriverError::Ignored => true,
            _ => false,
        };
        if needs_reset && connection.is_open() {
            if let Err(e) = connection.reset().await {
                tracing::debug!(error = %e, "reset after failed request failed");
            }
        }
    }
}
