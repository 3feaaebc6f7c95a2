//! Client-side cluster routing.
//!
//! A routed driver keeps one time-bounded snapshot of the cluster topology.
//! Once the snapshot's TTL runs out it is refreshed with a ROUTE round trip
//! before any further server selection; a stale table is never silently
//! reused, and a failed refresh never clobbers the table that is still there.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::{
    AccessMode, BoltAddress, ConnectionRequestData, DriverConfig, SessionConfig,
};
use crate::error::DriverError;
use crate::factory::ConnectionFactory;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::value::{Dict, Value};

/// Cluster member roles as reported by the routing procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    Route,
    Read,
    Write,
}

impl ServerRole {
    pub fn from_str(role: &str) -> Option<Self> {
        match role {
            "ROUTE" => Some(Self::Route),
            "READ" => Some(Self::Read),
            "WRITE" => Some(Self::Write),
            _ => None,
        }
    }
}

/// A topology snapshot with an absolute expiry.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    pub routers: Vec<BoltAddress>,
    pub readers: Vec<BoltAddress>,
    pub writers: Vec<BoltAddress>,
    pub expires_at: Instant,
}

impl RoutingTable {
    pub fn new(
        routers: Vec<BoltAddress>,
        readers: Vec<BoltAddress>,
        writers: Vec<BoltAddress>,
        expires_at: Instant,
    ) -> Self {
        Self {
            routers,
            readers,
            writers,
            expires_at,
        }
    }

    /// Parses the routing procedure result:
    /// `{servers: [{addresses, role}], ttl}`, possibly nested under `rt` as
    /// the ROUTE message returns it.
    pub fn parse(metadata: &Dict, now: Instant) -> Result<Self, DriverError> {
        let root = metadata
            .get("rt")
            .and_then(Value::as_map)
            .unwrap_or(metadata);

        let ttl = root
            .get("ttl")
            .and_then(Value::as_i64)
            .ok_or_else(|| DriverError::Routing("routing result has no ttl".to_string()))?;
        let servers = root
            .get("servers")
            .and_then(Value::as_list)
            .ok_or_else(|| DriverError::Routing("routing result has no servers".to_string()))?;

        let mut table = Self::new(
            Vec::new(),
            Vec::new(),
            Vec::new(),
            now + Duration::from_secs(ttl.max(0) as u64),
        );
        for server in servers {
            let server = server
                .as_map()
                .ok_or_else(|| DriverError::Routing("malformed server entry".to_string()))?;
            let role = server
                .get("role")
                .and_then(Value::as_str)
                .and_then(ServerRole::from_str)
                .ok_or_else(|| DriverError::Routing("server entry has no role".to_string()))?;
            let addresses = server
                .get("addresses")
                .and_then(Value::as_list)
                .ok_or_else(|| DriverError::Routing("server entry has no addresses".to_string()))?;
            for address in addresses {
                let address = address
                    .as_str()
                    .ok_or_else(|| DriverError::Routing("malformed address".to_string()))?;
                let parsed = BoltAddress::parse(address)?;
                match role {
                    ServerRole::Route => table.routers.push(parsed),
                    ServerRole::Read => table.readers.push(parsed),
                    ServerRole::Write => table.writers.push(parsed),
                }
            }
        }
        Ok(table)
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// The candidates serving `mode`: leaders for writes, followers for
    /// reads.
    pub fn servers_for(&self, mode: AccessMode) -> &[BoltAddress] {
        match mode {
            AccessMode::Write => &self.writers,
            AccessMode::Read => &self.readers,
        }
    }
}

/// Pools for a routed (clustered) deployment: one seed pool for routing
/// round trips plus one pool per cluster member, created on demand with the
/// credentials of the original URI (routing tables carry bare addresses).
pub struct RoutedPools {
    factory: ConnectionFactory,
    config: DriverConfig,
    seed_request: ConnectionRequestData,
    seed: ConnectionPool,
    pools: parking_lot::Mutex<HashMap<BoltAddress, ConnectionPool>>,
    table: parking_lot::RwLock<Option<RoutingTable>>,
    /// Single-flight guard: concurrent observers of a stale table coalesce
    /// into one refresh round trip.
    refresh_gate: tokio::sync::Mutex<()>,
    refreshes: AtomicU64,
}

impl RoutedPools {
    pub fn new(
        factory: ConnectionFactory,
        seed_request: ConnectionRequestData,
        config: DriverConfig,
    ) -> Self {
        let seed = ConnectionPool::new(factory.clone(), seed_request.clone(), &config);
        Self {
            factory,
            config,
            seed_request,
            seed,
            pools: parking_lot::Mutex::new(HashMap::new()),
            table: parking_lot::RwLock::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Resolves a server for the session's access mode and acquires a
    /// connection from that server's pool.
    pub async fn acquire(
        &self,
        session: &SessionConfig,
        bookmarks: Vec<String>,
    ) -> Result<PooledConnection, DriverError> {
        let address = self.next_server(session, bookmarks).await?;
        let pool = self.pool_for(&address);
        pool.acquire(session).await
    }

    /// Picks uniformly at random among the members carrying the wanted role.
    /// Random (not round-robin) selection is the deliberate load-spreading
    /// tradeoff of this driver.
    async fn next_server(
        &self,
        session: &SessionConfig,
        bookmarks: Vec<String>,
    ) -> Result<BoltAddress, DriverError> {
        let table = self.current_table(session, bookmarks).await?;
        let candidates = table.servers_for(session.access_mode);
        if candidates.is_empty() {
            return Err(DriverError::Routing(format!(
                "no servers available for {:?} access",
                session.access_mode
            )));
        }
        let index = rand::thread_rng().gen_range(0..candidates.len());
        Ok(candidates[index].clone())
    }

    /// Returns a fresh table, refreshing it first when stale or absent.
    async fn current_table(
        &self,
        session: &SessionConfig,
        bookmarks: Vec<String>,
    ) -> Result<RoutingTable, DriverError> {
        {
            let guard = self.table.read();
            if let Some(table) = guard.as_ref() {
                if !table.is_stale(Instant::now()) {
                    return Ok(table.clone());
                }
            }
        }

        let _flight = self.refresh_gate.lock().await;
        // Double-check: a concurrent caller may have refreshed while we
        // queued on the gate.
        {
            let guard = self.table.read();
            if let Some(table) = guard.as_ref() {
                if !table.is_stale(Instant::now()) {
                    return Ok(table.clone());
                }
            }
        }

        let refreshed = self.refresh(session, bookmarks).await?;
        *self.table.write() = Some(refreshed.clone());
        Ok(refreshed)
    }

    async fn refresh(
        &self,
        session: &SessionConfig,
        bookmarks: Vec<String>,
    ) -> Result<RoutingTable, DriverError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(seed = %self.seed_request.address, "refreshing routing table");

        let connection = self.seed.acquire(session).await.map_err(|e| {
            DriverError::Routing(format!("cannot reach a routing server: {e}"))
        })?;
        let context = Dict::from([(
            "address".to_string(),
            Value::from(self.seed_request.address.to_string()),
        )]);
        let outcome = connection
            .route(context, bookmarks, session.database.as_deref())
            .await;
        connection.release().await;

        let metadata =
            outcome.map_err(|e| DriverError::Routing(format!("routing procedure failed: {e}")))?;
        RoutingTable::parse(&metadata, Instant::now())
    }

    fn pool_for(&self, address: &BoltAddress) -> ConnectionPool {
        let mut pools = self.pools.lock();
        pools
            .entry(address.clone())
            .or_insert_with(|| {
                let request = ConnectionRequestData {
                    address: address.clone(),
                    scheme: self.seed_request.scheme.clone(),
                    auth: self.seed_request.auth.clone(),
                    user_agent: self.seed_request.user_agent.clone(),
                    ssl_mode: self.seed_request.ssl_mode,
                };
                ConnectionPool::new(self.factory.clone(), request, &self.config)
            })
            .clone()
    }

    /// How many refreshes have run. Exposed for tests and tracing.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Overrides the cached table (tests and manual invalidation).
    pub fn install_table(&self, table: RoutingTable) {
        *self.table.write() = Some(table);
    }

    pub async fn close(&self) {
        self.seed.close().await;
        let pools: Vec<ConnectionPool> = self.pools.lock().values().cloned().collect();
        for pool in pools {
            pool.close().await;
        }
    }
}

// Keep `Arc<RoutedPools>` ergonomic for the driver.
impl std::fmt::Debug for RoutedPools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedPools")
            .field("seed", &self.seed_request.address)
            .field("pools", &self.pools.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Auth;
    use crate::codec::{ProtocolVersion, ServerResponse};
    use crate::config::SslMode;
    use crate::testing::{FakeOpener, FakeProtocol, NullConnector, Reply, dict};

    fn routing_metadata(ttl: i64) -> Dict {
        let server = |role: &str, addresses: &[&str]| {
            Value::Map(dict(&[
                ("role", Value::from(role)),
                (
                    "addresses",
                    Value::List(addresses.iter().map(|a| Value::from(*a)).collect()),
                ),
            ]))
        };
        dict(&[(
            "rt",
            Value::Map(dict(&[
                ("ttl", Value::Integer(ttl)),
                (
                    "servers",
                    Value::List(vec![
                        server("WRITE", &["leader:7687"]),
                        server("READ", &["follower1:7687", "follower2:7687"]),
                        server("ROUTE", &["leader:7687", "follower1:7687"]),
                    ]),
                ),
            ])),
        )])
    }

    fn route_reply(ttl: i64) -> Reply {
        Reply::Response(ServerResponse::success(routing_metadata(ttl)))
    }

    fn seed_request() -> ConnectionRequestData {
        ConnectionRequestData {
            address: BoltAddress::new("seed", 7687),
            scheme: "neo4j".into(),
            auth: Auth::basic("neo4j", "secret"),
            user_agent: "test/1.0".into(),
            ssl_mode: SslMode::Disable,
        }
    }

    fn routed_with_replies(replies: Vec<Reply>) -> RoutedPools {
        let seed_protocol = FakeProtocol::scripted(ProtocolVersion::V4_4, replies);
        let factory = ConnectionFactory::new(
            std::sync::Arc::new(NullConnector),
            std::sync::Arc::new(FakeOpener::with_protocols(
                ProtocolVersion::V4_4,
                vec![seed_protocol],
            )),
        );
        RoutedPools::new(factory, seed_request(), DriverConfig::default())
    }

    #[test]
    fn parse_route_message_shape() {
        let table = RoutingTable::parse(&routing_metadata(300), Instant::now()).unwrap();
        assert_eq!(table.writers, vec![BoltAddress::new("leader", 7687)]);
        assert_eq!(table.readers.len(), 2);
        assert_eq!(table.routers.len(), 2);
        assert!(!table.is_stale(Instant::now()));
    }

    #[test]
    fn parse_unnested_procedure_shape() {
        let nested = routing_metadata(60);
        let flat = nested.get("rt").and_then(Value::as_map).unwrap().clone();
        let table = RoutingTable::parse(&flat, Instant::now()).unwrap();
        assert_eq!(table.writers.len(), 1);
    }

    #[test]
    fn parse_rejects_missing_ttl() {
        let metadata = dict(&[("servers", Value::List(vec![]))]);
        assert!(matches!(
            RoutingTable::parse(&metadata, Instant::now()),
            Err(DriverError::Routing(_))
        ));
    }

    #[test]
    fn ttl_expiry() {
        let table = RoutingTable::new(vec![], vec![], vec![], Instant::now());
        assert!(table.is_stale(Instant::now()));

        let fresh = RoutingTable::new(
            vec![],
            vec![],
            vec![],
            Instant::now() + Duration::from_secs(60),
        );
        assert!(!fresh.is_stale(Instant::now()));
    }

    #[tokio::test]
    async fn fresh_table_triggers_zero_refreshes() {
        let routed = routed_with_replies(vec![]);
        routed.install_table(RoutingTable::new(
            vec![],
            vec![BoltAddress::new("follower1", 7687)],
            vec![BoltAddress::new("leader", 7687)],
            Instant::now() + Duration::from_secs(300),
        ));

        let connection = routed
            .acquire(&SessionConfig::default(), Vec::new())
            .await
            .unwrap();
        assert_eq!(routed.refresh_count(), 0);
        assert_eq!(connection.info().address, BoltAddress::new("leader", 7687));
        connection.release().await;
    }

    #[tokio::test]
    async fn stale_table_triggers_exactly_one_refresh() {
        let routed = routed_with_replies(vec![route_reply(300)]);
        routed.install_table(RoutingTable::new(
            vec![],
            vec![],
            vec![BoltAddress::new("old-leader", 7687)],
            Instant::now(), // already expired
        ));

        let connection = routed
            .acquire(&SessionConfig::default(), Vec::new())
            .await
            .unwrap();
        assert_eq!(routed.refresh_count(), 1);
        assert_eq!(connection.info().address, BoltAddress::new("leader", 7687));
        connection.release().await;

        // Still fresh: the second acquire must not refresh again.
        let connection = routed
            .acquire(&SessionConfig::default(), Vec::new())
            .await
            .unwrap();
        assert_eq!(routed.refresh_count(), 1);
        connection.release().await;
    }

    #[tokio::test]
    async fn concurrent_stale_observers_coalesce_into_one_refresh() {
        let routed = std::sync::Arc::new(routed_with_replies(vec![route_reply(300)]));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let routed = routed.clone();
            handles.push(tokio::spawn(async move {
                routed
                    .current_table(&SessionConfig::default(), Vec::new())
                    .await
                    .map(|t| t.writers.len())
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 1);
        }
        assert_eq!(routed.refresh_count(), 1);
    }

    #[tokio::test]
    async fn read_mode_picks_followers() {
        let routed = routed_with_replies(vec![]);
        routed.install_table(RoutingTable::new(
            vec![],
            vec![
                BoltAddress::new("follower1", 7687),
                BoltAddress::new("follower2", 7687),
            ],
            vec![BoltAddress::new("leader", 7687)],
            Instant::now() + Duration::from_secs(300),
        ));

        for _ in 0..8 {
            let connection = routed
                .acquire(&SessionConfig::read(), Vec::new())
                .await
                .unwrap();
            let host = connection.info().address.host.clone();
            assert!(host.starts_with("follower"), "read went to {host}");
            connection.release().await;
        }
    }

    #[tokio::test]
    async fn missing_role_is_routing_error() {
        let routed = routed_with_replies(vec![]);
        routed.install_table(RoutingTable::new(
            vec![],
            vec![BoltAddress::new("follower1", 7687)],
            vec![], // no writers
            Instant::now() + Duration::from_secs(300),
        ));

        let err = routed
            .acquire(&SessionConfig::default(), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Routing(_)));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_the_old_table() {
        let routed = routed_with_replies(vec![crate::testing::failure(
            "Neo.ClientError.Procedure.ProcedureNotFound",
        )]);
        let old = RoutingTable::new(
            vec![],
            vec![],
            vec![BoltAddress::new("old-leader", 7687)],
            Instant::now(), // stale, forces a refresh attempt
        );
        routed.install_table(old);

        let err = routed
            .acquire(&SessionConfig::default(), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Routing(_)));

        // The stale table is still installed, not corrupted.
        let guard = routed.table.read();
        let table = guard.as_ref().unwrap();
        assert_eq!(table.writers, vec![BoltAddress::new("old-leader", 7687)]);
    }
}
