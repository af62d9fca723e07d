/// Structured error types for nova-core.
///
/// Configuration problems are startup-fatal, so every variant carries enough
/// context for the operator to fix the file without reading source.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file does not exist
    #[error("Config file not found: {path:?}")]
    NotFound { path: PathBuf },

    /// Config file could not be read
    #[error("Cannot open config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Config file is not valid TOML or does not match the schema
    #[error("Failed to parse config file (invalid TOML): {source}")]
    Parse {
        #[from]
        source: toml::de::Error,
    },

    /// A field is present but its value is unusable
    #[error("Invalid value for '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// A file referenced by the configuration is missing on disk
    #[error("{what} not found: {path:?}")]
    MissingFile { what: &'static str, path: PathBuf },
}

/// Result type alias for nova-core operations
pub type Result<T> = std::result::Result<T, ConfigError>;

impl ConfigError {
    /// Create an invalid field error
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    /// Create a missing file error
    pub fn missing_file(what: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::MissingFile {
            what,
            path: path.into(),
        }
    }
}
