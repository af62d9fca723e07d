//! Tracing setup for the nova-chat binary
//!
//! Three sinks hang off one `tracing_subscriber` registry:
//!   - console (optional): `RUST_LOG` wins over the configured level
//!   - general log file (`logging.error_log`): everything except access lines
//!   - access log file (`logging.access_log`): only events with target `nova::access`
//!
//! Usage:
//!   nova-chat --debug config.toml                # Debug logging to console
//!   RUST_LOG=nova_server=trace nova-chat         # Fine-grained console control

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use nova_core::LoggingSection;
use nova_server::ACCESS_LOG_TARGET;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{self, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Owns the open log files so they can be flushed on the way out
#[derive(Debug)]
pub struct LogHandle {
    files: Vec<Arc<File>>,
}

impl LogHandle {
    /// Flush and sync every log file
    pub fn close(self) -> io::Result<()> {
        for file in &self.files {
            (&**file).flush()?;
            file.sync_all()?;
        }
        Ok(())
    }
}

/// Build the subscriber and install it as the global default
pub fn init(logging: &LoggingSection, debug: bool) -> Result<LogHandle> {
    let (subscriber, handle) = build(logging, debug)?;
    subscriber.try_init().map_err(|err| anyhow!(err))?;
    Ok(handle)
}

/// Build the subscriber without installing it
pub fn build(
    logging: &LoggingSection,
    debug: bool,
) -> Result<(impl Subscriber + Send + Sync + 'static, LogHandle)> {
    let level = if debug {
        "debug"
    } else {
        logging
            .level_directive()
            .ok_or_else(|| anyhow!("unknown log level '{}'", logging.level))?
    };

    let console = if logging.console_output {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        Some(
            tracing_subscriber::fmt::layer()
                .with_target(debug)
                .compact()
                .with_filter(without_access(filter)?),
        )
    } else {
        None
    };

    let general_file = open_log(&logging.error_log)?;
    let general = tracing_subscriber::fmt::layer()
        .with_writer(Arc::clone(&general_file))
        .with_ansi(false)
        .with_filter(without_access(EnvFilter::new(level))?);

    let mut files = vec![general_file];
    let access = if logging.log_access {
        let file = open_log(&logging.access_log)?;
        files.push(Arc::clone(&file));
        Some(AccessLogLayer { file })
    } else {
        None
    };

    let subscriber = tracing_subscriber::registry()
        .with(console)
        .with(general)
        .with(access);

    Ok((subscriber, LogHandle { files }))
}

fn without_access(filter: EnvFilter) -> Result<EnvFilter> {
    let directive = format!("{}=off", ACCESS_LOG_TARGET);
    Ok(filter.add_directive(directive.parse()?))
}

fn open_log(path: &Path) -> Result<Arc<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;
    Ok(Arc::new(file))
}

/// Writes the bare message of access events, one per line
struct AccessLogLayer {
    file: Arc<File>,
}

impl<S: Subscriber> Layer<S> for AccessLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: layer::Context<'_, S>) {
        if event.metadata().target() != ACCESS_LOG_TARGET {
            return;
        }
        let mut message = MessageVisitor(String::new());
        event.record(&mut message);
        let _ = writeln!(&*self.file, "{}", message.0);
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0.push_str(value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            use fmt::Write as _;
            let _ = write!(self.0, "{:?}", value);
        }
    }
}
