//! nova-server: TLS-terminated HTTP/1.1 engine for the Nova chat backend
//!
//! - [`Server`] owns the scheduler and orchestrates graceful shutdown
//! - [`Listener`] accepts connections and spawns a [`Session`] per socket
//! - [`Session`] runs handshake → read → dispatch → write until close
//! - [`Router`] maps paths to [`Handler`]s
//! - [`ConnectionPool`] lends database connections to handlers

pub mod db;
pub mod deadline;
pub mod error;
pub mod http;
pub mod listener;
pub mod router;
pub mod routes;
pub mod server;
pub mod session;
pub mod tls;

pub use db::{
    ConnectionPool, Connector, DbConnection, DriverError, MemoryConnector, PgConnector,
    PoolConfig, PoolError, PoolStatus, Row,
};
pub use deadline::{Deadline, DeadlineExceeded};
pub use error::{ServerError, ServerResult};
pub use crate::http::{Request, Response};
pub use listener::Listener;
pub use router::{Handler, Router};
pub use server::{Server, ServerBuilder, ServerConfig, ShutdownOutcome};
pub use session::{Session, SessionState, SessionTimeouts, SessionTracker, ACCESS_LOG_TARGET};
pub use tls::TlsError;
