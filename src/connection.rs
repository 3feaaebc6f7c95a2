//! The Bolt connection: one protocol handle, its server-state tracking, and
//! the registry of not-yet-consumed result streams.
//!
//! Only one request/response can be in flight per connection and the server
//! answers strictly in order, so before any state-changing message every
//! still-live result stream produced by earlier RUNs is drained to
//! completion. Streams are registered through weak references: a dropped
//! stream never keeps the connection alive and is pruned on the next drain.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;

use crate::codec::{
    ProtocolHandle, ProtocolVersion, PullBatch, ServerResponse, TransactionExtra, result_extra,
};
use crate::config::{AccessMode, BoltAddress};
use crate::error::DriverError;
use crate::result::{ResultState, ResultSummary};
use crate::state::{
    BoltMessage, ResponseKind, ServerState, can_send_message, expected_signal_for_response,
    expected_state_for_response,
};
use crate::transport::EncryptionLevel;
use crate::value::{Dict, Record, Value};

/// Immutable identity of a connection, fixed at creation. The reuse gate
/// compares these fields against an incoming request.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: String,
    pub address: BoltAddress,
    pub user_agent: String,
    pub auth_fingerprint: String,
    pub encryption: EncryptionLevel,
    pub access_mode: AccessMode,
    pub database: Option<String>,
    /// Server agent string from the HELLO response, e.g. `Neo4j/5.13.0`.
    pub server_agent: String,
    pub version: ProtocolVersion,
}

/// Metadata of a successful RUN.
#[derive(Debug, Clone)]
pub struct RunMetadata {
    pub fields: Vec<String>,
    pub qid: Option<i64>,
    pub t_first: Option<i64>,
}

impl RunMetadata {
    pub fn from_metadata(metadata: &Dict) -> Self {
        let fields = metadata
            .get("fields")
            .and_then(Value::as_list)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            fields,
            qid: metadata.get("qid").and_then(Value::as_i64),
            t_first: metadata.get("t_first").and_then(Value::as_i64),
        }
    }
}

/// A Bolt connection. Cheap to clone; the clone shares the underlying
/// protocol handle and state. The pool hands out one checked-out reference at
/// a time, and the result streams derived from it are the only other holders.
#[derive(Clone)]
pub struct BoltConnection {
    inner: Arc<AsyncMutex<ConnectionInner>>,
    info: Arc<ConnectionInfo>,
    state: Arc<parking_lot::Mutex<ServerState>>,
}

struct ConnectionInner {
    protocol: Box<dyn ProtocolHandle>,
    state: Arc<parking_lot::Mutex<ServerState>>,
    subscriptions: Vec<Weak<ResultState>>,
}

impl BoltConnection {
    pub(crate) fn new(protocol: Box<dyn ProtocolHandle>, info: ConnectionInfo) -> Self {
        let state = Arc::new(parking_lot::Mutex::new(ServerState::Connected));
        Self {
            inner: Arc::new(AsyncMutex::new(ConnectionInner {
                protocol,
                state: state.clone(),
                subscriptions: Vec::new(),
            })),
            info: Arc::new(info),
            state,
        }
    }

    /// Applies the post-HELLO transition after the factory authenticated the
    /// connection.
    pub(crate) fn mark_ready(&self) {
        if let Some(next) = expected_state_for_response(
            ServerState::Connected,
            BoltMessage::Hello,
            ResponseKind::Success,
        ) {
            *self.state.lock() = next;
        }
    }

    pub fn server_state(&self) -> ServerState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.server_state() != ServerState::Defunct
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Begins an explicit transaction. Preconditioned states: READY.
    pub async fn begin(&self, extra: &TransactionExtra) -> Result<(), DriverError> {
        let mut inner = self.inner.lock().await;
        inner.consume_results().await?;
        let sent_from = inner.ensure_can_send(BoltMessage::Begin)?;
        let response = match inner.protocol.begin(extra.to_dict()).await {
            Ok(r) => r,
            Err(e) => return inner.fatal(e),
        };
        inner
            .apply_response(sent_from, BoltMessage::Begin, response)
            .map(|_| ())
    }

    /// Runs a query. Outside a transaction (or on servers without query ids,
    /// which serialize one result per connection) all earlier results are
    /// drained first.
    pub async fn run(
        &self,
        query: &str,
        parameters: Dict,
        extra: &TransactionExtra,
    ) -> Result<RunMetadata, DriverError> {
        let mut inner = self.inner.lock().await;
        if !inner.state().is_tx() || !inner.protocol.version().supports_qid() {
            inner.consume_results().await?;
        }
        let sent_from = inner.ensure_can_send(BoltMessage::Run)?;
        let response = match inner.protocol.run(query, parameters, extra.to_dict()).await {
            Ok(r) => r,
            Err(e) => return inner.fatal(e),
        };
        let metadata = inner.apply_response(sent_from, BoltMessage::Run, response)?;
        Ok(RunMetadata::from_metadata(&metadata))
    }

    /// Pulls one batch. `fetch_size` of −1 requests the whole remainder;
    /// `qid` of `None` targets the most recent query.
    pub async fn pull(
        &self,
        qid: Option<i64>,
        fetch_size: Option<i64>,
    ) -> Result<(Vec<Record>, ResultSummary), DriverError> {
        let mut inner = self.inner.lock().await;
        let batch = inner.pull_once(fetch_size, qid).await?;
        Ok((
            batch.records,
            ResultSummary {
                metadata: batch.summary.metadata,
            },
        ))
    }

    /// Discards the rest of a stream.
    pub async fn discard(&self, qid: Option<i64>) -> Result<ResultSummary, DriverError> {
        let mut inner = self.inner.lock().await;
        let sent_from = inner.ensure_can_send(BoltMessage::Discard)?;
        let supports_qid = inner.protocol.version().supports_qid();
        let extra = result_extra(
            supports_qid.then_some(-1),
            if supports_qid { qid } else { None },
        );
        let response = match inner.protocol.discard(extra).await {
            Ok(r) => r,
            Err(e) => return inner.fatal(e),
        };
        match response.kind {
            ResponseKind::Success => {
                let has_more = response.metadata.get("has_more").and_then(Value::as_bool);
                inner.interpret_streaming_summary(has_more);
                Ok(ResultSummary {
                    metadata: response.metadata,
                })
            }
            _ => Err(inner.failure_or_ignored(sent_from, BoltMessage::Discard, &response)),
        }
    }

    /// Commits the open transaction and returns the server bookmark, if any.
    pub async fn commit(&self) -> Result<Option<String>, DriverError> {
        let mut inner = self.inner.lock().await;
        inner.consume_results().await?;
        let sent_from = inner.ensure_can_send(BoltMessage::Commit)?;
        let response = match inner.protocol.commit().await {
            Ok(r) => r,
            Err(e) => return inner.fatal(e),
        };
        let metadata = inner.apply_response(sent_from, BoltMessage::Commit, response)?;
        Ok(metadata
            .get("bookmark")
            .and_then(Value::as_str)
            .map(String::from))
    }

    /// Rolls back the open transaction.
    pub async fn rollback(&self) -> Result<(), DriverError> {
        let mut inner = self.inner.lock().await;
        inner.consume_results().await?;
        let sent_from = inner.ensure_can_send(BoltMessage::Rollback)?;
        let response = match inner.protocol.rollback().await {
            Ok(r) => r,
            Err(e) => return inner.fatal(e),
        };
        inner
            .apply_response(sent_from, BoltMessage::Rollback, response)
            .map(|_| ())
    }

    /// Resets the connection back to READY, aborting whatever was in flight.
    /// The escape hatch out of FAILED and INTERRUPTED. A failed RESET leaves
    /// the connection DEFUNCT.
    pub async fn reset(&self) -> Result<(), DriverError> {
        let mut inner = self.inner.lock().await;
        let sent_from = inner.ensure_can_send(BoltMessage::Reset)?;
        if let Some(signal) = expected_signal_for_response(sent_from, BoltMessage::Reset) {
            tracing::trace!(connection = %self.info.id, ?signal, "raising signal");
        }
        inner.set_state(ServerState::Interrupted);
        let response = match inner.protocol.reset().await {
            Ok(r) => r,
            Err(e) => return inner.fatal(e),
        };
        match response.kind {
            ResponseKind::Success => {
                inner.subscriptions.clear();
                inner.set_state(ServerState::Ready);
                Ok(())
            }
            ResponseKind::Failure => {
                inner.fatal(DriverError::Server(response.as_server_error()))
            }
            ResponseKind::Ignored => inner.fatal(DriverError::Ignored),
        }
    }

    /// Fetches the routing table. Preconditioned states: READY.
    pub async fn route(
        &self,
        context: Dict,
        bookmarks: Vec<String>,
        database: Option<&str>,
    ) -> Result<Dict, DriverError> {
        let mut inner = self.inner.lock().await;
        inner.consume_results().await?;
        let sent_from = inner.ensure_can_send(BoltMessage::Route)?;
        let response = match inner.protocol.route(context, bookmarks, database).await {
            Ok(r) => r,
            Err(e) => return inner.fatal(e),
        };
        inner.apply_response(sent_from, BoltMessage::Route, response)
    }

    /// Tears the connection down: drains open streams, sends GOODBYE and
    /// releases the transport. Runs at most once, never fails; errors on the
    /// way out are logged and swallowed.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state() == ServerState::Defunct {
            return;
        }
        if inner.state() != ServerState::Failed {
            if let Err(e) = inner.consume_results().await {
                tracing::debug!(connection = %self.info.id, error = %e, "drain during close failed");
            }
            if inner.state() != ServerState::Defunct {
                if let Err(e) = inner.protocol.goodbye().await {
                    tracing::debug!(connection = %self.info.id, error = %e, "GOODBYE failed");
                }
            }
        }
        if let Err(e) = inner.protocol.close().await {
            tracing::debug!(connection = %self.info.id, error = %e, "transport close failed");
        }
        inner.subscriptions.clear();
        inner.set_state(ServerState::Defunct);
    }

    /// Registers a result stream so it gets drained before the next
    /// state-changing request. The registry holds a weak reference only.
    pub async fn subscribe_result(&self, result: &Arc<ResultState>) {
        self.inner.lock().await.subscriptions.push(Arc::downgrade(result));
    }

    /// Drains every live subscribed result to completion.
    pub async fn consume_results(&self) -> Result<(), DriverError> {
        self.inner.lock().await.consume_results().await
    }

    /// Pulls one batch into a subscribed stream's buffer. No-op when the
    /// stream was already finished (e.g. by a drain that won the lock).
    pub(crate) async fn fetch_batch(
        &self,
        stream: &Arc<ResultState>,
        fetch_size: Option<i64>,
    ) -> Result<(), DriverError> {
        let mut inner = self.inner.lock().await;
        inner.fetch_into(stream, fetch_size).await
    }

    /// Adjusts the transport read deadline.
    pub async fn set_timeout(&self, timeout: Option<Duration>) {
        self.inner.lock().await.protocol.set_timeout(timeout);
    }
}

impl ConnectionInner {
    fn state(&self) -> ServerState {
        *self.state.lock()
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock() = state;
    }

    fn ensure_can_send(&self, message: BoltMessage) -> Result<ServerState, DriverError> {
        let state = self.state();
        if state == ServerState::Defunct {
            return Err(DriverError::ConnectionClosed);
        }
        if !can_send_message(state, message) {
            return Err(DriverError::Protocol(format!(
                "{message:?} is not legal in server state {}",
                state.as_str()
            )));
        }
        Ok(state)
    }

    /// Marks the connection dead after a transport/codec failure.
    fn fatal<T>(&self, error: DriverError) -> Result<T, DriverError> {
        self.set_state(ServerState::Defunct);
        Err(error)
    }

    /// Applies the transition table for an unambiguous response and converts
    /// FAILURE/IGNORED into errors.
    fn apply_response(
        &self,
        sent_from: ServerState,
        message: BoltMessage,
        response: ServerResponse,
    ) -> Result<Dict, DriverError> {
        if let Some(next) = expected_state_for_response(sent_from, message, response.kind) {
            self.set_state(next);
        }
        match response.kind {
            ResponseKind::Success => Ok(response.metadata),
            ResponseKind::Failure => Err(DriverError::Server(response.as_server_error())),
            ResponseKind::Ignored => Err(DriverError::Ignored),
        }
    }

    fn failure_or_ignored(
        &self,
        sent_from: ServerState,
        message: BoltMessage,
        response: &ServerResponse,
    ) -> DriverError {
        if let Some(next) = expected_state_for_response(sent_from, message, response.kind) {
            self.set_state(next);
        }
        match response.kind {
            ResponseKind::Failure => DriverError::Server(response.as_server_error()),
            _ => DriverError::Ignored,
        }
    }

    /// Streams that are still alive and not yet finished. A dropped or fully
    /// drained stream no longer occupies the connection.
    fn live_subscription_count(&self) -> usize {
        self.subscriptions
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|s| !s.is_done())
            .count()
    }

    /// Decides the post-PULL/DISCARD state. Servers that omit `has_more`
    /// (protocol < 4) leave the count of live subscriptions as the only hint
    /// whether another stream is still open on this connection.
    fn interpret_streaming_summary(&self, has_more: Option<bool>) {
        let state = self.state();
        let next = if state.is_tx() {
            let more = has_more.unwrap_or_else(|| self.live_subscription_count() > 1);
            if more {
                ServerState::TxStreaming
            } else {
                ServerState::TxReady
            }
        } else if has_more.unwrap_or(false) {
            ServerState::Streaming
        } else {
            ServerState::Ready
        };
        self.set_state(next);
    }

    async fn pull_once(
        &mut self,
        fetch_size: Option<i64>,
        qid: Option<i64>,
    ) -> Result<PullBatch, DriverError> {
        let sent_from = self.ensure_can_send(BoltMessage::Pull)?;
        let supports_qid = self.protocol.version().supports_qid();
        let extra = result_extra(
            if supports_qid { fetch_size } else { None },
            if supports_qid { qid } else { None },
        );
        let batch = match self.protocol.pull(extra).await {
            Ok(b) => b,
            Err(e) => return self.fatal(e),
        };
        match batch.summary.kind {
            ResponseKind::Success => {
                let has_more = batch
                    .summary
                    .metadata
                    .get("has_more")
                    .and_then(Value::as_bool);
                self.interpret_streaming_summary(has_more);
                Ok(batch)
            }
            _ => Err(self.failure_or_ignored(sent_from, BoltMessage::Pull, &batch.summary)),
        }
    }

    /// Pulls one batch into a stream's shared buffer, completing it when the
    /// summary carries no `has_more`.
    async fn fetch_into(
        &mut self,
        stream: &ResultState,
        fetch_size: Option<i64>,
    ) -> Result<(), DriverError> {
        if stream.is_done() {
            return Ok(());
        }
        let batch = self.pull_once(fetch_size, stream.qid()).await?;
        let has_more = batch
            .summary
            .metadata
            .get("has_more")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        stream.push_rows(batch.records);
        if !has_more {
            stream.complete(batch.summary.metadata);
        }
        Ok(())
    }

    /// Drains every live subscribed stream to completion, then clears the
    /// registry (pruning dead weak references along the way).
    async fn consume_results(&mut self) -> Result<(), DriverError> {
        let live: Vec<Arc<ResultState>> = self
            .subscriptions
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for stream in live {
            while !stream.is_done() {
                self.fetch_into(&stream, Some(-1)).await?;
            }
        }
        self.subscriptions.clear();
        Ok(())
    }
}
