//! nova-chat - TLS chat backend server
//!
//! Loads a TOML configuration, opens the database pool, registers the
//! built-in routes and serves until Ctrl+C or SIGTERM.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use nova_core::NovaConfig;
use nova_server::db::{ConnectionPool, Connector, MemoryConnector, PgConnector, PoolConfig};
use nova_server::routes::register_builtin_routes;
use nova_server::{Router, Server, ServerConfig, ShutdownOutcome};
use tracing::{debug, error, info, warn};

mod tracing_setup;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const STATUS_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Parser, Debug)]
#[command(
    name = "nova-chat",
    author,
    version,
    about = "TLS-terminated chat backend server",
    long_about = "Serve the Nova chat HTTP API over TLS, backed by a PostgreSQL connection pool."
)]
struct Cli {
    /// Path to the configuration file
    #[arg(value_name = "CONFIG", conflicts_with = "config")]
    config_path: Option<PathBuf>,

    /// Path to the configuration file
    #[arg(long, short = 'c', value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging (overrides logging.level)
    #[arg(long)]
    debug: bool,

    /// Serve against an in-process database instead of PostgreSQL
    #[arg(long)]
    in_memory_db: bool,
}

impl Cli {
    fn config_file(&self) -> PathBuf {
        self.config
            .clone()
            .or_else(|| self.config_path.clone())
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }
}

fn main() {
    if let Err(err) = run(Cli::parse()) {
        // logging may not be up yet
        eprintln!("Fatal error: {:#}", err);
        error!("Fatal error: {:#}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let path = cli.config_file();
    let config = NovaConfig::load(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

    let logging = tracing_setup::init(&config.logging, cli.debug)
        .context("Failed to initialize logging")?;
    info!("Starting Nova Chat Server v{}", env!("CARGO_PKG_VERSION"));
    log_effective_config(&config);

    let result = serve(&config, cli.in_memory_db);

    info!("Nova Chat Server exited");
    logging.close().context("Failed to flush log files")?;
    result
}

fn serve(config: &NovaConfig, in_memory_db: bool) -> Result<()> {
    let builder =
        Server::builder(ServerConfig::from(config)).context("Failed to create server runtime")?;

    let connector: Arc<dyn Connector> = if in_memory_db {
        warn!("Using the in-memory database; data is not persisted");
        Arc::new(MemoryConnector::new())
    } else {
        Arc::new(
            PgConnector::from_section(&config.database)
                .context("Invalid database connection settings")?,
        )
    };
    info!("Connecting to database at {}", connector.describe());

    let pool = builder
        .block_on(ConnectionPool::new(
            connector,
            PoolConfig::from(&config.database),
        ))
        .context("Failed to initialize database connection pool")?;

    if builder.block_on(pool.health_check()) {
        info!("Database health check passed");
    } else {
        warn!("Database health check failed; continuing, requests may fail");
    }

    let router = Router::new();
    register_builtin_routes(&router, &pool);
    info!("Registered routes: {}", router.registered_paths().join(", "));

    let mut server = builder
        .build(Arc::new(router))
        .context("Failed to build server")?;
    server.start().context("Failed to start server")?;
    info!(
        "Server started on https://{}:{}",
        config.server.address,
        server
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(config.server.port)
    );

    let stop_requested = Arc::new(AtomicBool::new(false));
    {
        let stop_requested = Arc::clone(&stop_requested);
        server.handle().spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            stop_requested.store(true, Ordering::SeqCst);
        });
    }

    let mut last_status = Instant::now();
    while server.is_running() && !stop_requested.load(Ordering::SeqCst) {
        std::thread::sleep(POLL_INTERVAL);
        if last_status.elapsed() >= STATUS_INTERVAL {
            info!("Server is running normally. {}", pool.status());
            last_status = Instant::now();
        }
    }

    match server.stop() {
        ShutdownOutcome::Forced => warn!("Server stopped after forcing open sessions closed"),
        ShutdownOutcome::Graceful | ShutdownOutcome::NotRunning => info!("Server stopped"),
    }
    pool.close();
    Ok(())
}

fn log_effective_config(config: &NovaConfig) {
    let mut masked = config.clone();
    masked.database.password = "********".into();
    match toml::to_string_pretty(&masked) {
        Ok(rendered) => debug!("Effective configuration:\n{}", rendered),
        Err(e) => debug!("Effective configuration could not be rendered: {}", e),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
