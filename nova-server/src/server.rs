//! Server: owns the scheduler, the TLS context and the listener
//!
//! The scheduler is a multi-threaded tokio runtime with exactly `threads`
//! workers, created by [`Server::builder`] so the embedder can open its
//! connection pool on it before the server is built.
//!
//! [`Server::start`], [`Server::stop`] and dropping the server block the
//! calling thread; call them from outside the scheduler.

use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nova_core::NovaConfig;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ServerError, ServerResult};
use crate::http::ParseLimits;
use crate::listener::Listener;
use crate::router::Router;
use crate::session::{SessionContext, SessionTimeouts, SessionTracker};
use crate::tls;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub threads: usize,
    pub certificate_file: PathBuf,
    pub private_key_file: PathBuf,
    pub dh_params_file: PathBuf,
    pub timeouts: SessionTimeouts,
    pub limits: ParseLimits,
    /// How long `stop` waits for in-flight sessions before forcing
    pub graceful_shutdown_timeout: Duration,
    /// Polling interval while waiting for sessions to drain
    pub shutdown_check_interval: Duration,
}

impl From<&NovaConfig> for ServerConfig {
    fn from(config: &NovaConfig) -> Self {
        let server = &config.server;
        Self {
            address: server.address.clone(),
            port: server.port,
            threads: server.threads,
            certificate_file: config.ssl.certificate_file.clone(),
            private_key_file: config.ssl.private_key_file.clone(),
            dh_params_file: config.ssl.dh_params_file.clone(),
            timeouts: SessionTimeouts::from(&server.timeouts),
            limits: ParseLimits::default(),
            graceful_shutdown_timeout: Duration::from_secs(server.graceful_shutdown_timeout_secs),
            shutdown_check_interval: Duration::from_millis(server.shutdown_check_interval_ms),
        }
    }
}

/// How a call to [`Server::stop`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every session finished inside the grace window
    Graceful,
    /// The grace window elapsed and remaining sessions were cancelled
    Forced,
    /// The server was not running
    NotRunning,
}

/// First construction stage: the scheduler exists, the server does not yet
pub struct ServerBuilder {
    config: ServerConfig,
    runtime: Runtime,
}

impl ServerBuilder {
    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }

    /// Run a future to completion on the scheduler
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Wire the TLS context and the listener.
    ///
    /// Missing or unreadable TLS files and an unresolvable address are
    /// startup-fatal.
    pub fn build(self, router: Arc<Router>) -> ServerResult<Server> {
        let config = self.config;

        let acceptor = tls::load_acceptor(
            &config.certificate_file,
            &config.private_key_file,
            &config.dh_params_file,
        )?;
        info!("SSL context initialized successfully");

        let endpoint = resolve(&config.address, config.port)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tracker = SessionTracker::new();
        let ctx = SessionContext {
            router,
            timeouts: config.timeouts,
            limits: config.limits.clone(),
            shutdown: shutdown_rx,
            tracker: tracker.clone(),
        };
        let listener = Listener::new(endpoint, acceptor, ctx);

        Ok(Server {
            handle: self.runtime.handle().clone(),
            runtime: Some(self.runtime),
            config,
            listener,
            shutdown_tx,
            tracker,
            running: Arc::new(AtomicBool::new(false)),
            accept_task: None,
        })
    }
}

pub struct Server {
    config: ServerConfig,
    runtime: Option<Runtime>,
    handle: Handle,
    listener: Arc<Listener>,
    shutdown_tx: watch::Sender<bool>,
    tracker: SessionTracker,
    running: Arc<AtomicBool>,
    accept_task: Option<JoinHandle<()>>,
}

impl Server {
    /// Create the scheduler with `config.threads` worker threads
    pub fn builder(config: ServerConfig) -> ServerResult<ServerBuilder> {
        if config.threads == 0 {
            return Err(ServerError::Config(
                "threads must be at least 1".to_string(),
            ));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.threads)
            .thread_name("nova-worker")
            .enable_all()
            .build()
            .map_err(ServerError::Runtime)?;
        debug!("Scheduler created with {} worker threads", config.threads);

        Ok(ServerBuilder { config, runtime })
    }

    /// Bind the listener and begin accepting. Calling it on a running
    /// server logs a warning and does nothing.
    pub fn start(&mut self) -> ServerResult<()> {
        if self.running.load(Ordering::SeqCst) {
            warn!("Server is already running");
            return Ok(());
        }
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(ServerError::Stopped);
        };

        let task = {
            let _guard = runtime.enter();
            self.listener.start()?
        };
        self.accept_task = task;
        self.running.store(true, Ordering::SeqCst);

        info!(
            "Server started on {}:{} with {} threads",
            self.config.address,
            self.local_addr().map(|a| a.port()).unwrap_or(self.config.port),
            self.config.threads
        );
        Ok(())
    }

    /// Graceful shutdown.
    ///
    /// 1. stop accepting and tell sessions to finish
    /// 2. poll the live session count every check interval, up to the grace window
    /// 3. force-cancel whatever is left once the window elapses
    /// 4. shut the scheduler down and join every worker thread
    pub fn stop(&mut self) -> ShutdownOutcome {
        if !self.running.load(Ordering::SeqCst) {
            debug!("Server is not running");
            return ShutdownOutcome::NotRunning;
        }
        info!("Stopping server...");

        self.listener.stop();
        self.shutdown_tx.send_replace(true);

        let window = self.config.graceful_shutdown_timeout;
        let interval = self.config.shutdown_check_interval;
        let started = Instant::now();
        let drained = loop {
            let active = self.tracker.active();
            if active == 0 {
                break true;
            }
            let elapsed = started.elapsed();
            if elapsed >= window {
                break false;
            }
            debug!("Waiting for {} active sessions", active);
            std::thread::sleep(interval.min(window - elapsed));
        };

        if !drained {
            warn!(
                "Graceful shutdown timeout exceeded, forcing shutdown ({} sessions still active)",
                self.tracker.active()
            );
        }

        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        // Dropping the runtime cancels every remaining task at its next
        // suspension point and joins all workers, including one still inside
        // a blocking handler.
        if let Some(runtime) = self.runtime.take() {
            drop(runtime);
            debug!("Worker threads joined");
        }
        self.running.store(false, Ordering::SeqCst);

        if drained {
            info!("Server shutdown completed gracefully");
            ShutdownOutcome::Graceful
        } else {
            info!("Server shutdown completed forcefully");
            ShutdownOutcome::Forced
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Scheduler handle, e.g. for spawning a signal watcher
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn active_sessions(&self) -> usize {
        self.tracker.active()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

fn resolve(address: &str, port: u16) -> ServerResult<SocketAddr> {
    (address, port)
        .to_socket_addrs()
        .map_err(|_| ServerError::InvalidAddress(format!("{}:{}", address, port)))?
        .next()
        .ok_or_else(|| ServerError::InvalidAddress(format!("{}:{}", address, port)))
}
