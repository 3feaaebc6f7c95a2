//! Scripted fakes for driving the core without a real codec or server.
//!
//! `FakeProtocol` plays back a scripted sequence of replies while recording
//! the exact order of messages it saw, which is how the tests assert
//! drain-before-request ordering and extras shapes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::codec::{ProtocolHandle, ProtocolVersion, PullBatch, ServerResponse};
use crate::config::SslOptions;
use crate::error::DriverError;
use crate::factory::{OpenedProtocol, ProtocolOpener};
use crate::transport::{Connector, EncryptionLevel, Transport};
use crate::value::{Dict, Record, Value};

/// One scripted reply.
pub(crate) enum Reply {
    Response(ServerResponse),
    Batch(Vec<Record>, ServerResponse),
    IoError(String),
}

/// A log of `(message, extras)` pairs in send order, shared with the test.
pub(crate) type MessageLog = Arc<parking_lot::Mutex<Vec<(String, Dict)>>>;

pub(crate) struct FakeProtocol {
    version: ProtocolVersion,
    script: parking_lot::Mutex<VecDeque<Reply>>,
    /// When the script runs dry: succeed with empty metadata instead of
    /// panicking. Pool/routing tests that don't care about traffic use this.
    lenient: bool,
    log: MessageLog,
}

impl FakeProtocol {
    pub(crate) fn scripted(version: ProtocolVersion, script: Vec<Reply>) -> Self {
        Self {
            version,
            script: parking_lot::Mutex::new(script.into()),
            lenient: false,
            log: Arc::default(),
        }
    }

    /// A protocol that answers SUCCESS with empty metadata to everything.
    pub(crate) fn lenient(version: ProtocolVersion) -> Self {
        Self {
            version,
            script: parking_lot::Mutex::new(VecDeque::new()),
            lenient: true,
            log: Arc::default(),
        }
    }

    pub(crate) fn log(&self) -> MessageLog {
        self.log.clone()
    }

    fn record(&self, message: &str, extra: &Dict) {
        self.log.lock().push((message.to_string(), extra.clone()));
    }

    fn next_response(&self, message: &str) -> Result<ServerResponse, DriverError> {
        match self.script.lock().pop_front() {
            Some(Reply::Response(response)) => Ok(response),
            Some(Reply::IoError(detail)) => Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                detail,
            ))),
            Some(Reply::Batch(..)) => panic!("script expected a batch, {message} wants a response"),
            None if self.lenient => Ok(ServerResponse::success(Dict::new())),
            None => panic!("fake protocol script exhausted at {message}"),
        }
    }

    fn next_batch(&self) -> Result<PullBatch, DriverError> {
        match self.script.lock().pop_front() {
            Some(Reply::Batch(records, summary)) => Ok(PullBatch { records, summary }),
            Some(Reply::Response(summary)) => Ok(PullBatch {
                records: Vec::new(),
                summary,
            }),
            Some(Reply::IoError(detail)) => Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                detail,
            ))),
            None if self.lenient => Ok(PullBatch {
                records: Vec::new(),
                summary: ServerResponse::success(Dict::new()),
            }),
            None => panic!("fake protocol script exhausted at PULL"),
        }
    }
}

#[async_trait::async_trait]
impl ProtocolHandle for FakeProtocol {
    fn version(&self) -> ProtocolVersion {
        self.version
    }

    async fn hello(&mut self, extra: Dict) -> Result<ServerResponse, DriverError> {
        self.record("HELLO", &extra);
        self.next_response("HELLO")
    }

    async fn run(
        &mut self,
        query: &str,
        _parameters: Dict,
        extra: Dict,
    ) -> Result<ServerResponse, DriverError> {
        self.record(&format!("RUN {query}"), &extra);
        self.next_response("RUN")
    }

    async fn pull(&mut self, extra: Dict) -> Result<PullBatch, DriverError> {
        self.record("PULL", &extra);
        self.next_batch()
    }

    async fn discard(&mut self, extra: Dict) -> Result<ServerResponse, DriverError> {
        self.record("DISCARD", &extra);
        self.next_response("DISCARD")
    }

    async fn begin(&mut self, extra: Dict) -> Result<ServerResponse, DriverError> {
        self.record("BEGIN", &extra);
        self.next_response("BEGIN")
    }

    async fn commit(&mut self) -> Result<ServerResponse, DriverError> {
        self.record("COMMIT", &Dict::new());
        self.next_response("COMMIT")
    }

    async fn rollback(&mut self) -> Result<ServerResponse, DriverError> {
        self.record("ROLLBACK", &Dict::new());
        self.next_response("ROLLBACK")
    }

    async fn reset(&mut self) -> Result<ServerResponse, DriverError> {
        self.record("RESET", &Dict::new());
        self.next_response("RESET")
    }

    async fn route(
        &mut self,
        context: Dict,
        _bookmarks: Vec<String>,
        _database: Option<&str>,
    ) -> Result<ServerResponse, DriverError> {
        self.record("ROUTE", &context);
        self.next_response("ROUTE")
    }

    async fn goodbye(&mut self) -> Result<(), DriverError> {
        self.record("GOODBYE", &Dict::new());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        self.record("CLOSE", &Dict::new());
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        let millis = timeout.map(|t| t.as_millis() as i64).unwrap_or(-1);
        self.record("SET_TIMEOUT", &dict(&[("ms", Value::Integer(millis))]));
    }
}

/// Convenience replies.
pub(crate) fn success() -> Reply {
    Reply::Response(ServerResponse::success(Dict::new()))
}

pub(crate) fn success_with(entries: &[(&str, Value)]) -> Reply {
    Reply::Response(ServerResponse::success(dict(entries)))
}

pub(crate) fn failure(code: &str) -> Reply {
    Reply::Response(ServerResponse::failure(code, "scripted failure"))
}

pub(crate) fn ignored() -> Reply {
    Reply::Response(ServerResponse::ignored())
}

pub(crate) fn batch(rows: &[i64], has_more: bool) -> Reply {
    let records = rows
        .iter()
        .map(|v| Record::new(vec![Value::Integer(*v)]))
        .collect();
    Reply::Batch(
        records,
        ServerResponse::success(dict(&[("has_more", Value::Bool(has_more))])),
    )
}

pub(crate) fn run_success(fields: &[&str], qid: Option<i64>) -> Reply {
    let mut entries = vec![(
        "fields",
        Value::List(fields.iter().map(|f| Value::from(*f)).collect()),
    )];
    if let Some(qid) = qid {
        entries.push(("qid", Value::Integer(qid)));
    }
    success_with(&entries)
}

pub(crate) fn dict(entries: &[(&str, Value)]) -> Dict {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// A transport that goes nowhere; the fakes never touch it.
pub(crate) struct NullTransport;

#[async_trait::async_trait]
impl Transport for NullTransport {
    async fn write(&mut self, _data: &[u8]) -> Result<(), DriverError> {
        Ok(())
    }

    async fn read(&mut self, _max_len: usize) -> Result<bytes::Bytes, DriverError> {
        Ok(bytes::Bytes::new())
    }

    async fn disconnect(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn set_timeout(&mut self, _timeout: Option<Duration>) {}

    fn encryption(&self) -> EncryptionLevel {
        EncryptionLevel::None
    }
}

pub(crate) struct NullConnector;

#[async_trait::async_trait]
impl Connector for NullConnector {
    async fn connect(
        &self,
        _host: &str,
        _port: u16,
        _ssl: &SslOptions,
    ) -> Result<Box<dyn Transport>, DriverError> {
        Ok(Box::new(NullTransport))
    }
}

/// An opener handing out scripted protocols in order, falling back to
/// lenient ones once the prepared list is exhausted. Counts every open.
pub(crate) struct FakeOpener {
    version: ProtocolVersion,
    prepared: parking_lot::Mutex<VecDeque<FakeProtocol>>,
    pub(crate) opened: AtomicUsize,
}

impl FakeOpener {
    pub(crate) fn lenient(version: ProtocolVersion) -> Self {
        Self {
            version,
            prepared: parking_lot::Mutex::new(VecDeque::new()),
            opened: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_protocols(
        version: ProtocolVersion,
        protocols: Vec<FakeProtocol>,
    ) -> Self {
        Self {
            version,
            prepared: parking_lot::Mutex::new(protocols.into()),
            opened: AtomicUsize::new(0),
        }
    }

    pub(crate) fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ProtocolOpener for FakeOpener {
    async fn open(
        &self,
        _transport: Box<dyn Transport>,
        _auth: &crate::auth::Auth,
        _user_agent: &str,
    ) -> Result<OpenedProtocol, DriverError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let protocol = self
            .prepared
            .lock()
            .pop_front()
            .unwrap_or_else(|| FakeProtocol::lenient(self.version));
        Ok(OpenedProtocol {
            handle: Box::new(protocol),
            hello_metadata: dict(&[("server", Value::from("FakeDB/1.0"))]),
        })
    }
}
