//! Byte-stream transport abstraction underneath the codec.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::SslOptions;
use crate::error::DriverError;

/// How the transport of a connection is (or is not) encrypted. Part of the
/// connection identity checked by the reuse gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionLevel {
    None,
    Encrypted,
    SelfSigned,
}

/// A byte-stream the codec reads and writes Bolt chunks over.
#[async_trait::async_trait]
pub trait Transport: Send {
    async fn write(&mut self, data: &[u8]) -> Result<(), DriverError>;

    /// Reads up to `max_len` bytes, waiting for at least one. Honors the
    /// configured read deadline.
    async fn read(&mut self, max_len: usize) -> Result<Bytes, DriverError>;

    async fn disconnect(&mut self) -> Result<(), DriverError>;

    fn timeout(&self) -> Option<Duration>;

    fn set_timeout(&mut self, timeout: Option<Duration>);

    fn encryption(&self) -> EncryptionLevel;
}

/// Plain TCP transport.
pub struct TcpTransport {
    stream: TcpStream,
    timeout: Option<Duration>,
    encryption: EncryptionLevel,
    buf: BytesMut,
}

impl TcpTransport {
    /// Connects to `host:port` within `connect_timeout`.
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        encryption: EncryptionLevel,
    ) -> Result<Self, DriverError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                DriverError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {host}:{port} timed out"),
                ))
            })??;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            timeout: None,
            encryption,
            buf: BytesMut::with_capacity(8 * 1024),
        })
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn write(&mut self, data: &[u8]) -> Result<(), DriverError> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    async fn read(&mut self, max_len: usize) -> Result<Bytes, DriverError> {
        self.buf.clear();
        self.buf.resize(max_len, 0);

        let n = match self.timeout {
            Some(deadline) => {
                tokio::time::timeout(deadline, self.stream.read(&mut self.buf[..max_len]))
                    .await
                    .map_err(|_| {
                        DriverError::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "read timed out",
                        ))
                    })??
            }
            None => self.stream.read(&mut self.buf[..max_len]).await?,
        };

        if n == 0 {
            return Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )));
        }

        Ok(Bytes::copy_from_slice(&self.buf[..n]))
    }

    async fn disconnect(&mut self) -> Result<(), DriverError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn encryption(&self) -> EncryptionLevel {
        self.encryption
    }
}

/// Opens transports for the factory. Injected once at driver construction so
/// the transport backend is an explicit choice, not process-wide state.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        ssl: &SslOptions,
    ) -> Result<Box<dyn Transport>, DriverError>;
}

/// Default connector: plain TCP. TLS establishment is the responsibility of
/// a connector implementation layered on the resolved [`SslOptions`].
pub struct TcpConnector {
    pub connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        ssl: &SslOptions,
    ) -> Result<Box<dyn Transport>, DriverError> {
        if ssl.enabled {
            return Err(DriverError::Protocol(
                "TcpConnector does not establish TLS; supply a TLS-capable connector".to_string(),
            ));
        }

        let transport =
            TcpTransport::connect(host, port, self.connect_timeout, EncryptionLevel::None).await?;
        Ok(Box::new(transport))
    }
}
