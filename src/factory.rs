//! Creates and authenticates Bolt connections, and decides when an existing
//! one can stand in for a new request.

use std::sync::Arc;

use crate::auth::Auth;
use crate::codec::ProtocolHandle;
use crate::config::{ConnectionRequestData, SessionConfig, resolve_ssl};
use crate::connection::{BoltConnection, ConnectionInfo};
use crate::error::DriverError;
use crate::transport::{Connector, Transport};
use crate::value::{Dict, Value};

/// The codec's entry point: given an established transport, negotiate a
/// protocol version and authenticate with HELLO/LOGON.
#[async_trait::async_trait]
pub trait ProtocolOpener: Send + Sync {
    async fn open(
        &self,
        transport: Box<dyn Transport>,
        auth: &Auth,
        user_agent: &str,
    ) -> Result<OpenedProtocol, DriverError>;
}

/// An authenticated protocol handle plus the HELLO SUCCESS metadata.
pub struct OpenedProtocol {
    pub handle: Box<dyn ProtocolHandle>,
    pub hello_metadata: Dict,
}

/// Connection factory. Constructed once per driver with an explicit
/// transport connector and codec opener; nothing here is process-global.
#[derive(Clone)]
pub struct ConnectionFactory {
    connector: Arc<dyn Connector>,
    opener: Arc<dyn ProtocolOpener>,
}

impl ConnectionFactory {
    pub fn new(connector: Arc<dyn Connector>, opener: Arc<dyn ProtocolOpener>) -> Self {
        Self { connector, opener }
    }

    /// Opens a transport, negotiates and authenticates, and wraps the result
    /// in a [`BoltConnection`] carrying the identity fields the reuse gate
    /// compares later.
    pub async fn create_connection(
        &self,
        request: &ConnectionRequestData,
        session: &SessionConfig,
    ) -> Result<BoltConnection, DriverError> {
        let (encryption, ssl) =
            resolve_ssl(request.ssl_mode, &request.scheme, &request.address.host);
        let transport = self
            .connector
            .connect(&request.address.host, request.address.port, &ssl)
            .await?;

        let opened = self
            .opener
            .open(transport, &request.auth, &request.user_agent)
            .await?;

        let server_agent = opened
            .hello_metadata
            .get("server")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let info = ConnectionInfo {
            id: uuid::Uuid::new_v4().to_string(),
            address: request.address.clone(),
            user_agent: request.user_agent.clone(),
            auth_fingerprint: request.auth.fingerprint(),
            encryption,
            access_mode: session.access_mode,
            database: session.database.clone(),
            server_agent,
            version: opened.handle.version(),
        };

        tracing::debug!(
            connection = %info.id,
            address = %info.address,
            version = %info.version,
            server = %info.server_agent,
            "created connection"
        );

        let connection = BoltConnection::new(opened.handle, info);
        connection.mark_ready();
        Ok(connection)
    }

    /// The reuse gate: every identity field must match, otherwise handing the
    /// connection out would either leak it across tenants or silently change
    /// the session's target.
    pub fn can_reuse_connection(
        &self,
        connection: &BoltConnection,
        request: &ConnectionRequestData,
        session: &SessionConfig,
    ) -> bool {
        let info = connection.info();
        connection.is_open()
            && info.address == request.address
            && info.auth_fingerprint == request.auth.fingerprint()
            && info.encryption == request.encryption()
            && info.user_agent == request.user_agent
            && info.access_mode == session.access_mode
            && info.database == session.database
    }

    /// Hands a pooled connection back out for a new session. Nothing is
    /// remerged: the only per-session knob not in the reuse gate is
    /// `fetch_size`, and that is a per-PULL argument rather than connection
    /// state.
    pub fn reuse_connection(
        &self,
        connection: BoltConnection,
        _session: &SessionConfig,
    ) -> BoltConnection {
        connection
    }
}
