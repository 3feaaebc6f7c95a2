//! BoltDrive — A pure-Rust driver core for Bolt graph databases.
//!
//! This crate implements the client side of the Bolt connection lifecycle for
//! Neo4j and compatible graph databases: a per-connection protocol state
//! machine, a semaphore-bounded connection pool, client-side cluster routing,
//! and session/transaction orchestration with causal bookmarks. Wire-level
//! encoding is delegated to an external codec via the [`codec::ProtocolHandle`]
//! seam.
//!
//! # Architecture
//!
//! - **`state`** — Server-state machine as an auditable transition table
//! - **`transport`** — Byte-stream abstraction (`Transport`, `Connector`)
//! - **`codec`** — The seam to an external Bolt codec library
//! - **`connection`** — Bolt connection: state tracking, result drainage
//! - **`factory`** — Connection creation, authentication, reuse gate
//! - **`pool`** — Bounded pool with acquisition timeout and safe reuse
//! - **`routing`** — TTL-bounded cluster topology and server selection
//! - **`session`** / **`transaction`** — Unit-of-work orchestration, retries
//! - **`bookmark`** — Causal-consistency tokens

pub mod auth;
pub mod bookmark;
pub mod codec;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod factory;
pub mod pool;
pub mod result;
pub mod routing;
pub mod session;
pub mod state;
pub mod transaction;
pub mod transport;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::Auth;
pub use bookmark::{Bookmark, BookmarkHolder};
pub use config::{AccessMode, DriverConfig, SessionConfig, SslMode, TransactionConfig};
pub use connection::BoltConnection;
pub use driver::Driver;
pub use error::{Classification, DriverError, ServerError};
pub use pool::{ConnectionPool, PooledConnection};
pub use result::{BoltResult, ResultSummary};
pub use routing::RoutingTable;
pub use session::{Session, Statement};
pub use state::ServerState;
pub use transaction::{TransactionState, UnmanagedTransaction};
pub use value::{Dict, Record, Value};
