//! Accept loop: owns the listening socket and spawns one session per connection

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{ServerError, ServerResult};
use crate::session::{Session, SessionContext};

const LISTEN_BACKLOG: u32 = 1024;

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub struct Listener {
    endpoint: SocketAddr,
    acceptor: TlsAcceptor,
    ctx: SessionContext,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Listener {
    pub fn new(endpoint: SocketAddr, acceptor: TlsAcceptor, ctx: SessionContext) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            endpoint,
            acceptor,
            ctx,
            running: AtomicBool::new(false),
            stop_tx,
            local_addr: Mutex::new(None),
        })
    }

    /// Bind, listen and spawn the accept loop.
    ///
    /// Must be called from within the scheduler's context. Returns `None`
    /// when the listener is already running.
    pub fn start(self: &Arc<Self>) -> ServerResult<Option<JoinHandle<()>>> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Listener is already running");
            return Ok(None);
        }

        let listener = match self.bind() {
            Ok(listener) => listener,
            Err(source) => {
                self.running.store(false, Ordering::SeqCst);
                error!("Failed to bind {}: {}", self.endpoint, source);
                return Err(ServerError::Bind {
                    addr: self.endpoint.to_string(),
                    source,
                });
            }
        };

        let local = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local);
        self.stop_tx.send_replace(false);
        info!("Listening on {}", local);

        let this = Arc::clone(self);
        Ok(Some(tokio::spawn(this.accept_loop(listener))))
    }

    fn bind(&self) -> std::io::Result<TcpListener> {
        let socket = match self.endpoint {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(self.endpoint)?;
        socket.listen(LISTEN_BACKLOG)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut stop = self.stop_tx.subscribe();

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = stop.wait_for(|stopped| *stopped) => break,
            };

            match accepted {
                Ok((socket, peer)) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    debug!("Accepted connection from {}", peer);
                    if let Err(e) = socket.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                    }

                    let mut session =
                        Session::new(socket, peer, self.acceptor.clone(), self.ctx.clone());
                    tokio::spawn(
                        async move { session.start().await }
                            .instrument(info_span!("session", peer = %peer)),
                    );
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        debug!("Accept loop finished");
    }

    /// Stop accepting; the socket closes when the accept loop exits.
    ///
    /// Safe to call any number of times.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.stop_tx.send_replace(true);
            info!("Listener stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Address actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
