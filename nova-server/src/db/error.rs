//! Database error types

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a connector or a single connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The statement failed but the connection is still usable
    #[error("{0}")]
    Statement(String),

    /// The connection is broken or could not be established
    #[error("connection error: {0}")]
    Connection(String),
}

impl DriverError {
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection(err.to_string()),
            // 57P01 admin_shutdown, 57P02 crash_shutdown, 57P03 cannot_connect_now
            sqlx::Error::Database(db)
                if db
                    .code()
                    .is_some_and(|code| matches!(code.as_ref(), "57P01" | "57P02" | "57P03")) =>
            {
                Self::Connection(err.to_string())
            }
            _ => Self::Statement(err.to_string()),
        }
    }
}

/// Errors surfaced by the connection pool to its callers
#[derive(Error, Debug)]
pub enum PoolError {
    /// A connection could not be opened (construction or replacement)
    #[error("Database connection failed: {0}")]
    Connect(String),

    #[error("No database connections could be established during initialization")]
    Empty,

    /// Acquisition waited for the full timeout without a free connection
    #[error("Timeout waiting for database connection ({0:?})")]
    Exhausted(Duration),

    #[error("Query execution failed: {0}")]
    Query(String),

    #[error("Connection pool is closed")]
    Closed,
}

pub type PoolResult<T> = Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_error_messages() {
        let err = PoolError::Query("syntax error at or near \"INVALID\"".into());
        assert_eq!(
            err.to_string(),
            "Query execution failed: syntax error at or near \"INVALID\""
        );

        let err = PoolError::Exhausted(Duration::from_secs(2));
        assert!(err.to_string().starts_with("Timeout waiting for database connection"));
    }

    #[test]
    fn io_errors_are_connection_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(DriverError::from(sqlx::Error::Io(io)).is_connection());
        assert!(!DriverError::from(sqlx::Error::RowNotFound).is_connection());
    }
}
