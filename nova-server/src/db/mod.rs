//! Database access: connector abstraction and the bounded connection pool
//!
//! Handlers never talk to a driver directly. They call
//! [`ConnectionPool::execute_query`], which borrows a connection, runs the
//! statement inside a transaction and returns the connection (or a
//! replacement) to the pool whatever the outcome.

pub mod error;
pub mod memory;
pub mod pool;
pub mod postgres;
pub mod row;

use async_trait::async_trait;

pub use error::{DriverError, PoolError, PoolResult};
pub use memory::MemoryConnector;
pub use pool::{ConnectionPool, PoolConfig, PoolStatus, PooledConnection};
pub use postgres::PgConnector;
pub use row::Row;

/// One live database session
#[async_trait]
pub trait DbConnection: Send + 'static {
    /// Cheap local check; false once the connection is known to be broken
    fn is_open(&self) -> bool;

    /// Round-trip to the server; marks the connection broken on failure
    async fn ping(&mut self) -> bool;

    /// Run `sql` in its own transaction and return every row
    async fn execute(&mut self, sql: &str) -> Result<Vec<Row>, DriverError>;
}

/// Opens new connections for the pool
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn DbConnection>, DriverError>;

    /// Human-readable target for logs; must not contain credentials
    fn describe(&self) -> String;
}
