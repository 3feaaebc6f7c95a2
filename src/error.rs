//! Error types for the Bolt driver.

use std::time::Duration;

use crate::value::Dict;

/// Errors that can occur while driving a Bolt connection or pool.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Transport-level failure. Always fatal to the connection that raised it.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message was sent in a state where it is not legal, or the server
    /// answered with something the protocol does not allow.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A structured FAILURE response from the server.
    #[error("server error {}: {}", .0.code, .0.message)]
    Server(ServerError),

    /// The server answered IGNORED; the connection needs a RESET before it
    /// will process further requests.
    #[error("request ignored by server; connection requires reset")]
    Ignored,

    /// HELLO/LOGON was rejected.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// No connection became available within the acquisition budget. Distinct
    /// from transport timeouts so callers can tell pool pressure apart from an
    /// unreachable server.
    #[error("connection pool exhausted: no connection after {elapsed:?} (budget {budget:?})")]
    PoolTimeout { elapsed: Duration, budget: Duration },

    /// The pool has been closed.
    #[error("connection pool is closed")]
    PoolClosed,

    /// The routing table could not be obtained or refreshed.
    #[error("routing error: {0}")]
    Routing(String),

    /// Misuse of a transaction (e.g. running on a committed one) or a failed
    /// BEGIN.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// The connection is defunct or was explicitly closed.
    #[error("connection is closed")]
    ConnectionClosed,
}

impl DriverError {
    /// Whether the session-level retry wrapper may re-run the unit of work
    /// after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Server(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Classification of a server error code, derived from the prefix of
/// `Neo.<Classification>.<Category>.<Title>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    ClientError,
    TransientError,
    DatabaseError,
}

/// The code and message of a FAILURE response, kept verbatim so callers can
/// apply their own retry policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: String,
    pub message: String,
}

impl ServerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Builds a server error from FAILURE metadata (`code` and `message`
    /// keys).
    pub fn from_metadata(metadata: &Dict) -> Self {
        let code = metadata
            .get("code")
            .and_then(|v| v.as_str())
            .unwrap_or("Neo.DatabaseError.General.UnknownError");
        let message = metadata
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("an unknown error occurred");
        Self::new(code, message)
    }

    /// Classifies by the second segment of the code. Unknown codes classify
    /// as database errors so they are never retried by accident.
    pub fn classification(&self) -> Classification {
        match self.code.split('.').nth(1) {
            Some("ClientError") => Classification::ClientError,
            Some("TransientError") => Classification::TransientError,
            _ => Classification::DatabaseError,
        }
    }

    /// Returns the `<Category>` segment of the code, e.g. `Request`.
    pub fn category(&self) -> Option<&str> {
        self.code.split('.').nth(2)
    }

    /// Transient errors are retryable, as are the client errors that signal
    /// lock contention or a leader switch in a cluster.
    pub fn is_retryable(&self) -> bool {
        match self.classification() {
            Classification::TransientError => true,
            Classification::ClientError => matches!(
                self.code.as_str(),
                "Neo.ClientError.Cluster.NotALeader"
                    | "Neo.ClientError.Transaction.LockClientStopped"
            ),
            Classification::DatabaseError => false,
        }
    }

    /// Whether the connection must be RESET before further use. Malformed
    /// requests (`Request` category) leave the server in a usable state; every
    /// other failure does not.
    pub fn requires_reset(&self) -> bool {
        !(self.classification() == Classification::ClientError
            && self.category() == Some("Request"))
    }
}

impl From<ServerError> for DriverError {
    fn from(e: ServerError) -> Self {
        Self::Server(e)
    }
}
