//! nova-core: configuration and shared error types for the Nova chat backend
//!
//! The server engine (`nova-server`) and the binary (`nova-cli`) both read
//! their settings from [`NovaConfig`].

pub mod config;
pub mod error;

pub use config::{
    DatabaseSection, LoggingSection, NovaConfig, OverflowPolicy, ServerSection, SslSection,
    TimeoutsSection,
};
pub use error::{ConfigError, Result};
