use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};

const MIN_PORT: u16 = 1;
const MAX_THREADS: usize = 1024;

/// Environment variable that replaces `database.password` when set
pub const DB_PASSWORD_ENV: &str = "NOVA_DB_PASSWORD";

/// Centralized configuration for the Nova chat backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NovaConfig {
    pub server: ServerSection,
    pub ssl: SslSection,
    pub database: DatabaseSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    pub address: String,
    pub port: u16,
    pub threads: usize,
    #[serde(default = "default_graceful_shutdown_secs")]
    pub graceful_shutdown_timeout_secs: u64,
    #[serde(default = "default_shutdown_check_interval_ms")]
    pub shutdown_check_interval_ms: u64,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
}

/// Per-phase session timeouts, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_handshake_secs")]
    pub handshake_secs: u64,
    #[serde(default = "default_read_write_secs")]
    pub read_write_secs: u64,
    #[serde(default = "default_shutdown_secs")]
    pub shutdown_secs: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            handshake_secs: default_handshake_secs(),
            read_write_secs: default_read_write_secs(),
            shutdown_secs: default_shutdown_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslSection {
    pub certificate_file: PathBuf,
    pub private_key_file: PathBuf,
    pub dh_params_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub db_name: String,
    pub max_connections: u32,
    /// Seconds to wait for a pooled connection (and for a new one to open)
    pub connection_timeout: u64,
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

/// What the pool does when a woken waiter finds the idle queue empty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Open an extra connection beyond `max_connections` (soft cap)
    #[default]
    Elastic,
    /// Keep waiting until the acquisition deadline (hard cap)
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_access_log")]
    pub access_log: PathBuf,
    #[serde(default = "default_error_log")]
    pub error_log: PathBuf,
    #[serde(default = "default_true")]
    pub console_output: bool,
    #[serde(default = "default_true")]
    pub log_access: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            access_log: default_access_log(),
            error_log: default_error_log(),
            console_output: true,
            log_access: true,
        }
    }
}

impl LoggingSection {
    /// Map the configured level onto a `tracing` filter directive.
    ///
    /// Accepts the usual names plus `warning` and `fatal`.
    pub fn level_directive(&self) -> Option<&'static str> {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "trace" => Some("trace"),
            "debug" => Some("debug"),
            "info" => Some("info"),
            "warn" | "warning" => Some("warn"),
            "error" | "fatal" => Some("error"),
            _ => None,
        }
    }
}

impl NovaConfig {
    /// Load, apply environment overrides and validate.
    ///
    /// Fails hard with an actionable error; a server must not start on a
    /// half-valid configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::parse(&content)?;
        config.apply_env_overrides();
        config.validate()?;

        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse TOML without touching the environment or the filesystem
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(password) = std::env::var(DB_PASSWORD_ENV) {
            if !password.is_empty() {
                self.database.password = password;
            }
        }
    }

    /// Check every invariant the server relies on at construction time
    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        if server.address.trim().is_empty() {
            return Err(ConfigError::invalid("server.address", "cannot be empty"));
        }
        if server.port < MIN_PORT {
            return Err(ConfigError::invalid(
                "server.port",
                "must be between 1 and 65535",
            ));
        }
        if server.threads < 1 || server.threads > MAX_THREADS {
            return Err(ConfigError::invalid(
                "server.threads",
                format!("must be between 1 and {}", MAX_THREADS),
            ));
        }
        if server.graceful_shutdown_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "server.graceful_shutdown_timeout_secs",
                "must be at least 1",
            ));
        }
        if server.shutdown_check_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "server.shutdown_check_interval_ms",
                "must be at least 1",
            ));
        }
        let timeouts = &server.timeouts;
        if timeouts.handshake_secs == 0 || timeouts.read_write_secs == 0 || timeouts.shutdown_secs == 0 {
            return Err(ConfigError::invalid(
                "server.timeouts",
                "every timeout must be at least 1 second",
            ));
        }

        let ssl = &self.ssl;
        for (what, path) in [
            ("SSL certificate file", &ssl.certificate_file),
            ("SSL private key file", &ssl.private_key_file),
            ("SSL DH params file", &ssl.dh_params_file),
        ] {
            if !path.exists() {
                return Err(ConfigError::missing_file(what, path));
            }
        }

        let db = &self.database;
        if db.address.trim().is_empty() {
            return Err(ConfigError::invalid("database.address", "cannot be empty"));
        }
        if db.port < MIN_PORT {
            return Err(ConfigError::invalid(
                "database.port",
                "must be between 1 and 65535",
            ));
        }
        if db.username.is_empty() {
            return Err(ConfigError::invalid("database.username", "cannot be empty"));
        }
        if db.password.is_empty() {
            return Err(ConfigError::invalid("database.password", "cannot be empty"));
        }
        if db.db_name.is_empty() {
            return Err(ConfigError::invalid("database.db_name", "cannot be empty"));
        }
        if db.max_connections == 0 {
            return Err(ConfigError::invalid(
                "database.max_connections",
                "must be at least 1",
            ));
        }
        if db.connection_timeout == 0 {
            return Err(ConfigError::invalid(
                "database.connection_timeout",
                "must be at least 1",
            ));
        }

        let logging = &self.logging;
        if logging.level_directive().is_none() {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("unknown level '{}'", logging.level),
            ));
        }
        if logging.access_log.as_os_str().is_empty() {
            return Err(ConfigError::invalid("logging.access_log", "cannot be empty"));
        }
        if logging.error_log.as_os_str().is_empty() {
            return Err(ConfigError::invalid("logging.error_log", "cannot be empty"));
        }

        Ok(())
    }
}

fn default_graceful_shutdown_secs() -> u64 {
    30
}

fn default_shutdown_check_interval_ms() -> u64 {
    1000
}

fn default_handshake_secs() -> u64 {
    30
}

fn default_read_write_secs() -> u64 {
    30
}

fn default_shutdown_secs() -> u64 {
    5
}

fn default_ssl_mode() -> String {
    "require".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_access_log() -> PathBuf {
    PathBuf::from("access.log")
}

fn default_error_log() -> PathBuf {
    PathBuf::from("error.log")
}

fn default_true() -> bool {
    true
}
