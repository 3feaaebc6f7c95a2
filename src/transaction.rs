//! Unmanaged (explicitly committed) transactions.

use crate::bookmark::BookmarkHolder;
use crate::codec::TransactionExtra;
use crate::config::SessionConfig;
use crate::error::DriverError;
use crate::pool::PooledConnection;
use crate::result::BoltResult;
use crate::value::Dict;

/// The lifecycle of a transaction. `Active` is the only state that accepts
/// work; all others are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    /// Ended by a connection-fatal failure rather than an explicit
    /// commit/rollback.
    Terminated,
}

/// A transaction the caller commits or rolls back explicitly. Holds its
/// pooled connection until it reaches a terminal state.
pub struct UnmanagedTransaction {
    connection: Option<PooledConnection>,
    state: TransactionState,
    bookmarks: BookmarkHolder,
    database: Option<String>,
    impersonated_user: Option<String>,
    fetch_size: i64,
}

impl UnmanagedTransaction {
    pub(crate) fn new(
        connection: PooledConnection,
        bookmarks: BookmarkHolder,
        session: &SessionConfig,
        fetch_size: i64,
    ) -> Self {
        Self {
            connection: Some(connection),
            state: TransactionState::Active,
            bookmarks,
            database: session.database.clone(),
            impersonated_user: session.impersonated_user.clone(),
            fetch_size,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_committed(&self) -> bool {
        self.state == TransactionState::Committed
    }

    pub fn is_rolled_back(&self) -> bool {
        self.state == TransactionState::RolledBack
    }

    pub fn is_finished(&self) -> bool {
        self.state != TransactionState::Active
    }

    fn ensure_active(&self) -> Result<&PooledConnection, DriverError> {
        if self.is_finished() {
            return Err(DriverError::Transaction(format!(
                "transaction is already finished ({:?})",
                self.state
            )));
        }
        Ok(self.connection.as_ref().expect("active transaction has a connection"))
    }

    /// Runs a statement inside the transaction and returns its lazy result.
    ///
    /// On failure the transaction finishes itself: a server error that leaves
    /// the connection usable (`Request` category) is only marked rolled back
    /// locally — the server has already discarded the transaction — while any
    /// other failure classification triggers an explicit RESET before the
    /// error surfaces.
    pub async fn run(
        &mut self,
        query: &str,
        parameters: Dict,
    ) -> Result<BoltResult, DriverError> {
        let connection = self.ensure_active()?;
        let extra = TransactionExtra {
            database: self.database.clone(),
            impersonated_user: self.impersonated_user.clone(),
            ..Default::default()
        };
        match connection.run(query, parameters, &extra).await {
            Ok(metadata) => {
                let result = BoltResult::subscribe(
                    connection.connection().clone(),
                    metadata,
                    self.fetch_size,
                    None,
                )
                .await;
                Ok(result)
            }
            Err(e) => {
                self.finish_after_failure(&e).await;
                Err(e)
            }
        }
    }

    /// Commits. Captures the server bookmark into the session's holder so
    /// later transactions in (or sharing) this session observe the write.
    pub async fn commit(&mut self) -> Result<(), DriverError> {
        let connection = self.ensure_active()?;
        match connection.commit().await {
            Ok(bookmark) => {
                if let Some(token) = bookmark {
                    self.bookmarks.update_from_server(token);
                }
                self.state = TransactionState::Committed;
                self.release_connection().await;
                Ok(())
            }
            Err(e) => {
                self.finish_after_failure(&e).await;
                Err(e)
            }
        }
    }

    /// Rolls back explicitly.
    pub async fn rollback(&mut self) -> Result<(), DriverError> {
        let connection = self.ensure_active()?;
        match connection.rollback().await {
            Ok(()) => {
                self.state = TransactionState::RolledBack;
                self.release_connection().await;
                Ok(())
            }
            Err(e) => {
                self.finish_after_failure(&e).await;
                Err(e)
            }
        }
    }

    async fn finish_after_failure(&mut self, error: &DriverError) {
        let connection = self.connection.as_ref().expect("failure while holding connection");
        match error {
            DriverError::Server(server) => {
                if server.requires_reset() {
                    if let Err(e) = connection.reset().await {
                        tracing::debug!(error = %e, "reset after transaction failure failed");
                    }
                }
                self.state = TransactionState::RolledBack;
            }
            DriverError::Ignored | DriverError::Protocol(_) => {
                if let Err(e) = connection.reset().await {
                    tracing::debug!(error = %e, "reset after transaction failure failed");
                }
                self.state = TransactionState::Terminated;
            }
            // Transport failures already defuncted the connection.
            _ => self.state = TransactionState::Terminated,
        }
        self.release_connection().await;
    }

    async fn release_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.release().await;
        }
    }
}
