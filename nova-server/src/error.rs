//! Error types for nova-server

use std::io;

use thiserror::Error;

use crate::tls::TlsError;

pub type ServerResult<T> = Result<T, ServerError>;

/// Startup-fatal failures of the server and its listener
#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("Invalid server configuration: {0}")]
    Config(String),

    #[error("Invalid listen address '{0}'")]
    InvalidAddress(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to build I/O scheduler: {0}")]
    Runtime(#[source] io::Error),

    #[error("Server has been stopped and cannot be restarted")]
    Stopped,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
