//! The seam between the driver core and an external Bolt codec.
//!
//! This crate does not pack or unpack the wire format. A codec library
//! implements [`ProtocolHandle`] over an established transport; the driver
//! only sees per-message round trips producing structured
//! SUCCESS/FAILURE/IGNORED responses plus record batches.

use std::time::Duration;

use crate::config::AccessMode;
use crate::error::{DriverError, ServerError};
use crate::state::ResponseKind;
use crate::value::{Dict, Record, Value};

/// The negotiated Bolt protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const V3_0: Self = Self::new(3, 0);
    pub const V4_4: Self = Self::new(4, 4);
    pub const V5_4: Self = Self::new(5, 4);

    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Protocol 4+ supports PULL/DISCARD with `n`/`qid` extras; version 3
    /// only has PULL_ALL/DISCARD_ALL.
    pub fn supports_qid(&self) -> bool {
        self.major >= 4
    }

    /// Protocol 4+ reports `has_more` in every streaming summary. Older
    /// servers omit it, and the connection falls back to counting live
    /// result subscriptions.
    pub fn has_explicit_has_more(&self) -> bool {
        self.major >= 4
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A structured server response: the summary kind plus its metadata map.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerResponse {
    pub kind: ResponseKind,
    pub metadata: Dict,
}

impl ServerResponse {
    pub fn success(metadata: Dict) -> Self {
        Self {
            kind: ResponseKind::Success,
            metadata,
        }
    }

    pub fn failure(code: &str, message: &str) -> Self {
        Self {
            kind: ResponseKind::Failure,
            metadata: Dict::from([
                ("code".to_string(), Value::from(code)),
                ("message".to_string(), Value::from(message)),
            ]),
        }
    }

    pub fn ignored() -> Self {
        Self {
            kind: ResponseKind::Ignored,
            metadata: Dict::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == ResponseKind::Success
    }

    /// Converts a FAILURE response into its [`ServerError`].
    pub fn as_server_error(&self) -> ServerError {
        ServerError::from_metadata(&self.metadata)
    }
}

/// Records plus the trailing summary of a PULL round trip.
#[derive(Debug, Clone)]
pub struct PullBatch {
    pub records: Vec<Record>,
    pub summary: ServerResponse,
}

/// Per-message send/receive over one Bolt connection, implemented by the
/// external codec. A handle owns its transport; `close` releases it.
///
/// Implementations map `pull`/`discard` onto PULL_ALL/DISCARD_ALL for
/// protocol versions before 4.0 (the extras carry no `n`/`qid` there).
#[async_trait::async_trait]
pub trait ProtocolHandle: Send {
    /// The version negotiated during the handshake.
    fn version(&self) -> ProtocolVersion;

    async fn hello(&mut self, extra: Dict) -> Result<ServerResponse, DriverError>;

    async fn run(
        &mut self,
        query: &str,
        parameters: Dict,
        extra: Dict,
    ) -> Result<ServerResponse, DriverError>;

    async fn pull(&mut self, extra: Dict) -> Result<PullBatch, DriverError>;

    async fn discard(&mut self, extra: Dict) -> Result<ServerResponse, DriverError>;

    async fn begin(&mut self, extra: Dict) -> Result<ServerResponse, DriverError>;

    async fn commit(&mut self) -> Result<ServerResponse, DriverError>;

    async fn rollback(&mut self) -> Result<ServerResponse, DriverError>;

    async fn reset(&mut self) -> Result<ServerResponse, DriverError>;

    async fn route(
        &mut self,
        context: Dict,
        bookmarks: Vec<String>,
        database: Option<&str>,
    ) -> Result<ServerResponse, DriverError>;

    /// Sends GOODBYE. No response follows; the server closes the connection.
    async fn goodbye(&mut self) -> Result<(), DriverError>;

    /// Releases the underlying transport.
    async fn close(&mut self) -> Result<(), DriverError>;

    /// Adjusts the transport read deadline.
    fn set_timeout(&mut self, timeout: Option<Duration>);
}

/// The transaction-scoped extras attached to RUN and BEGIN.
#[derive(Debug, Clone, Default)]
pub struct TransactionExtra {
    pub database: Option<String>,
    pub tx_timeout: Option<Duration>,
    pub bookmarks: Vec<String>,
    pub mode: Option<AccessMode>,
    pub tx_metadata: Option<Dict>,
    pub impersonated_user: Option<String>,
}

impl TransactionExtra {
    /// Assembles the extras dictionary. Keys are only present when set; the
    /// write access mode is the server default and is never sent.
    pub fn to_dict(&self) -> Dict {
        let mut extra = Dict::new();
        if !self.bookmarks.is_empty() {
            extra.insert(
                "bookmarks".to_string(),
                Value::List(self.bookmarks.iter().map(|b| Value::from(b.as_str())).collect()),
            );
        }
        if self.mode == Some(AccessMode::Read) {
            extra.insert("mode".to_string(), Value::from("r"));
        }
        if let Some(timeout) = self.tx_timeout {
            extra.insert(
                "tx_timeout".to_string(),
                Value::Integer(timeout.as_millis() as i64),
            );
        }
        if let Some(metadata) = &self.tx_metadata {
            extra.insert("tx_metadata".to_string(), Value::Map(metadata.clone()));
        }
        if let Some(db) = &self.database {
            extra.insert("db".to_string(), Value::from(db.as_str()));
        }
        if let Some(user) = &self.impersonated_user {
            extra.insert("imp_user".to_string(), Value::from(user.as_str()));
        }
        extra
    }
}

/// Builds the PULL/DISCARD extras: `n` (−1 = all remaining) and `qid`
/// (omitted for "most recent" and on protocols without query ids).
pub fn result_extra(fetch_size: Option<i64>, qid: Option<i64>) -> Dict {
    let mut extra = Dict::new();
    if let Some(n) = fetch_size {
        extra.insert("n".to_string(), Value::Integer(n));
    }
    if let Some(qid) = qid {
        extra.insert("qid".to_string(), Value::Integer(qid));
    }
    extra
}
