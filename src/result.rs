//! Lazy result streams.
//!
//! A result belongs to exactly one connection and one query id. Rows arrive
//! in PULL batches of `fetch_size`; the terminal summary rides on the last
//! batch. The connection keeps a non-owning reference to every stream it
//! produced so it can force-drain them before the next request — buffered
//! rows stay readable afterwards, the stream just stops going to the server.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::bookmark::BookmarkHolder;
use crate::connection::{BoltConnection, RunMetadata};
use crate::error::DriverError;
use crate::value::{Dict, Record, Value};

/// The summary metadata closing a result stream (or one PULL batch of it).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSummary {
    pub metadata: Dict,
}

impl ResultSummary {
    /// Whether more records remain server-side. Servers before protocol 4
    /// omit the flag; absence means the stream is finished.
    pub fn has_more(&self) -> bool {
        self.metadata
            .get("has_more")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// The causal-consistency token returned after an auto-commit write.
    pub fn bookmark(&self) -> Option<&str> {
        self.metadata.get("bookmark").and_then(Value::as_str)
    }

    /// The `type` field of the summary (`r`, `w`, `rw`, `s`).
    pub fn query_type(&self) -> Option<&str> {
        self.metadata.get("type").and_then(Value::as_str)
    }
}

/// State shared between a [`BoltResult`] and its connection's subscription
/// registry. The stream owns an `Arc`; the connection holds only a `Weak`, so
/// dropping the stream lets the registry prune it lazily.
pub struct ResultState {
    qid: Option<i64>,
    rows: parking_lot::Mutex<VecDeque<Record>>,
    done: AtomicBool,
    summary: parking_lot::Mutex<Option<Dict>>,
    bookmarks: Option<BookmarkHolder>,
}

impl ResultState {
    pub(crate) fn new(qid: Option<i64>, bookmarks: Option<BookmarkHolder>) -> Arc<Self> {
        Arc::new(Self {
            qid,
            rows: parking_lot::Mutex::new(VecDeque::new()),
            done: AtomicBool::new(false),
            summary: parking_lot::Mutex::new(None),
            bookmarks,
        })
    }

    pub(crate) fn qid(&self) -> Option<i64> {
        self.qid
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn push_rows(&self, records: Vec<Record>) {
        self.rows.lock().extend(records);
    }

    pub(crate) fn pop_row(&self) -> Option<Record> {
        self.rows.lock().pop_front()
    }

    /// Marks the stream finished and records the terminal summary. Forwards
    /// the server bookmark to the session's holder, if one is attached.
    pub(crate) fn complete(&self, summary: Dict) {
        if let Some(holder) = &self.bookmarks {
            if let Some(token) = summary.get("bookmark").and_then(Value::as_str) {
                holder.update_from_server(token);
            }
        }
        *self.summary.lock() = Some(summary);
        self.done.store(true, Ordering::Release);
    }

    pub(crate) fn summary(&self) -> Option<ResultSummary> {
        self.summary
            .lock()
            .clone()
            .map(|metadata| ResultSummary { metadata })
    }
}

/// A lazily-pulled query result.
pub struct BoltResult {
    connection: BoltConnection,
    state: Arc<ResultState>,
    fields: Vec<String>,
    fetch_size: i64,
}

impl BoltResult {
    /// Creates the stream for a completed RUN and registers it with the
    /// connection so pending rows are drained before the next request.
    pub(crate) async fn subscribe(
        connection: BoltConnection,
        metadata: RunMetadata,
        fetch_size: i64,
        bookmarks: Option<BookmarkHolder>,
    ) -> Self {
        let state = ResultState::new(metadata.qid, bookmarks);
        connection.subscribe_result(&state).await;
        Self {
            connection,
            state,
            fields: metadata.fields,
            fetch_size,
        }
    }

    /// The column names declared by the server for this query.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Returns the next record, fetching another batch when the buffer runs
    /// dry. `None` once the stream is exhausted.
    pub async fn next(&mut self) -> Result<Option<Record>, DriverError> {
        loop {
            if let Some(record) = self.state.pop_row() {
                return Ok(Some(record));
            }
            if self.state.is_done() {
                return Ok(None);
            }
            self.connection
                .fetch_batch(&self.state, Some(self.fetch_size))
                .await?;
        }
    }

    /// Drains the stream and returns all remaining records with the terminal
    /// summary.
    pub async fn collect(mut self) -> Result<(Vec<Record>, ResultSummary), DriverError> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await? {
            records.push(record);
        }
        Ok((records, self.state.summary().unwrap_or_default()))
    }

    /// Tells the server to drop the remainder of the stream. Already-buffered
    /// records stay readable.
    pub async fn discard(&mut self) -> Result<ResultSummary, DriverError> {
        if self.state.is_done() {
            return Ok(self.state.summary().unwrap_or_default());
        }
        let summary = self.connection.discard(self.state.qid()).await?;
        self.state.complete(summary.metadata.clone());
        Ok(summary)
    }

    /// The terminal summary, once the stream has finished.
    pub fn summary(&self) -> Option<ResultSummary> {
        self.state.summary()
    }
}

impl std::fmt::Debug for BoltResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoltResult")
            .field("fields", &self.fields)
            .field("fetch_size", &self.fetch_size)
            .field("done", &self.state.is_done())
            .finish()
    }
}
