//! Per-connection session state machine
//!
//! `Handshaking → Reading → Dispatching → Writing → {Reading | Closing} → Closed`
//!
//! One task drives one session, so every step runs strictly after the
//! previous one finished and the session's buffer, request and response are
//! never touched concurrently. Each suspension point (handshake, read,
//! write, TLS shutdown) runs under the session [`Deadline`]; expiry moves
//! the session straight to `Closing`.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::FutureExt;
use nova_core::TimeoutsSection;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::deadline::{Deadline, DeadlineExceeded};
use crate::http::{
    internal_error, read_request, request_keep_alive, response_needs_eof, set_keep_alive,
    write_response, CodecError, ParseLimits, Request, Response,
};
use crate::router::Router;

/// Target for access log events
pub const ACCESS_LOG_TARGET: &str = "nova::access";

const INITIAL_BUFFER_CAPACITY: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Reading,
    Dispatching,
    Writing,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub handshake: Duration,
    /// Applied separately to each read and each write
    pub read_write: Duration,
    /// TLS close_notify exchange
    pub shutdown: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(30),
            read_write: Duration::from_secs(30),
            shutdown: Duration::from_secs(5),
        }
    }
}

impl From<&TimeoutsSection> for SessionTimeouts {
    fn from(section: &TimeoutsSection) -> Self {
        Self {
            handshake: Duration::from_secs(section.handshake_secs),
            read_write: Duration::from_secs(section.read_write_secs),
            shutdown: Duration::from_secs(section.shutdown_secs),
        }
    }
}

/// Counts sessions that have been created and not yet dropped
#[derive(Debug, Clone, Default)]
pub struct SessionTracker {
    active: Arc<AtomicUsize>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn enter(&self) -> ActiveSession {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveSession {
            active: Arc::clone(&self.active),
        }
    }
}

#[derive(Debug)]
struct ActiveSession {
    active: Arc<AtomicUsize>,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything sessions share, cloned into each one by the listener
#[derive(Clone)]
pub struct SessionContext {
    pub router: Arc<Router>,
    pub timeouts: SessionTimeouts,
    pub limits: ParseLimits,
    /// Flips to `true` when the server begins shutting down
    pub shutdown: watch::Receiver<bool>,
    pub tracker: SessionTracker,
}

struct Transport {
    socket: TcpStream,
    acceptor: TlsAcceptor,
}

enum ReadOutcome {
    Request(Request),
    /// Peer closed cleanly between requests
    Eof,
    /// Server shutdown while idle
    Shutdown,
    TimedOut,
    Failed(CodecError),
}

pub struct Session {
    transport: Option<Transport>,
    peer: SocketAddr,
    ctx: SessionContext,
    state: SessionState,
    deadline: Deadline,
    buffer: BytesMut,
    running: bool,
    _active: ActiveSession,
}

impl Session {
    pub fn new(
        socket: TcpStream,
        peer: SocketAddr,
        acceptor: TlsAcceptor,
        ctx: SessionContext,
    ) -> Self {
        Self::with_transport(Some(Transport { socket, acceptor }), peer, ctx)
    }

    fn with_transport(transport: Option<Transport>, peer: SocketAddr, ctx: SessionContext) -> Self {
        let active = ctx.tracker.enter();
        Self {
            transport,
            peer,
            ctx,
            state: SessionState::Handshaking,
            deadline: Deadline::new(),
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            running: false,
            _active: active,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Run the TLS handshake, then serve requests until the connection ends
    pub async fn start(&mut self) {
        let transport = match self.transport.take() {
            Some(transport) if !self.running => transport,
            other => {
                self.transport = other;
                warn!("Session is already running");
                return;
            }
        };
        self.running = true;

        self.state = SessionState::Handshaking;
        self.deadline.expires_after(self.ctx.timeouts.handshake);
        let handshake = self
            .deadline
            .run(transport.acceptor.accept(transport.socket))
            .await;

        match handshake {
            Ok(Ok(stream)) => {
                debug!("TLS handshake completed");
                self.serve(stream).await;
            }
            Ok(Err(e)) => {
                debug!("TLS handshake failed: {}", e);
                self.finish();
            }
            Err(DeadlineExceeded) => {
                debug!("TLS handshake timed out");
                self.finish();
            }
        }
    }

    /// Request/response loop over an established stream
    pub(crate) async fn serve<S>(&mut self, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.running = true;

        loop {
            self.state = SessionState::Reading;
            self.deadline.expires_after(self.ctx.timeouts.read_write);

            let request = match self.read(&mut stream).await {
                ReadOutcome::Request(request) => request,
                ReadOutcome::Eof => {
                    debug!("Client closed connection");
                    break;
                }
                ReadOutcome::Shutdown => {
                    debug!("Closing idle session for shutdown");
                    break;
                }
                ReadOutcome::TimedOut => {
                    debug!("Session timed out while reading");
                    break;
                }
                ReadOutcome::Failed(CodecError::Io(e)) if is_disconnect(&e) => {
                    debug!("Client disconnected: {}", e);
                    break;
                }
                ReadOutcome::Failed(e) => {
                    warn!("Read error: {}", e);
                    break;
                }
            };
            self.log_request(&request);

            self.state = SessionState::Dispatching;
            self.deadline.cancel();
            let mut response = self.dispatch(&request).await;

            let keep_alive = request_keep_alive(&request) && !self.shutting_down();
            *response.version_mut() = request.version();
            set_keep_alive(&mut response, keep_alive);

            self.state = SessionState::Writing;
            self.deadline.expires_after(self.ctx.timeouts.read_write);
            match self.deadline.run(write_response(&mut stream, &response)).await {
                Ok(Ok(_)) => self.log_response(&response),
                Ok(Err(e)) => {
                    debug!("Write error: {}", e);
                    break;
                }
                Err(DeadlineExceeded) => {
                    debug!("Session timed out while writing");
                    break;
                }
            }

            if response_needs_eof(&response) {
                break;
            }
        }

        self.close(&mut stream).await;
    }

    async fn read<S>(&mut self, stream: &mut S) -> ReadOutcome
    where
        S: AsyncRead + Unpin,
    {
        // Shutdown may only interrupt a session that has no part of the
        // next request buffered.
        if self.buffer.is_empty() {
            let mut shutdown = self.ctx.shutdown.clone();
            let first = tokio::select! {
                result = self.deadline.run(stream.read_buf(&mut self.buffer)) => result,
                _ = wait_for_shutdown(&mut shutdown) => return ReadOutcome::Shutdown,
            };
            match first {
                Err(DeadlineExceeded) => return ReadOutcome::TimedOut,
                Ok(Err(e)) => return ReadOutcome::Failed(CodecError::Io(e)),
                Ok(Ok(0)) => return ReadOutcome::Eof,
                Ok(Ok(_)) => {}
            }
        }

        let read = read_request(stream, &mut self.buffer, &self.ctx.limits);
        match self.deadline.run(read).await {
            Err(DeadlineExceeded) => ReadOutcome::TimedOut,
            Ok(Ok(Some(request))) => ReadOutcome::Request(request),
            Ok(Ok(None)) => ReadOutcome::Eof,
            Ok(Err(e)) => ReadOutcome::Failed(e),
        }
    }

    /// Never fails: handler errors and panics become the 500 envelope
    async fn dispatch(&self, request: &Request) -> Response {
        let Some(handler) = self.ctx.router.find_handler(request) else {
            return self.ctx.router.handle_not_found(request);
        };

        match AssertUnwindSafe(handler.handle_request(request))
            .catch_unwind()
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!("Exception in request handler: {:#}", e);
                internal_error()
            }
            Err(panic) => {
                error!("Request handler panicked: {}", panic_message(panic.as_ref()));
                internal_error()
            }
        }
    }

    async fn close<S>(&mut self, stream: &mut S)
    where
        S: AsyncWrite + Unpin,
    {
        self.state = SessionState::Closing;
        self.deadline.expires_after(self.ctx.timeouts.shutdown);

        match self.deadline.run(stream.shutdown()).await {
            Ok(Ok(())) => debug!("Session closed"),
            Ok(Err(e)) if is_disconnect(&e) => debug!("Session closed by peer: {}", e),
            Ok(Err(e)) => warn!("Shutdown error: {}", e),
            Err(DeadlineExceeded) => debug!("TLS shutdown timed out"),
        }
        self.finish();
    }

    fn finish(&mut self) {
        self.deadline.cancel();
        self.buffer.clear();
        self.state = SessionState::Closed;
    }

    fn shutting_down(&self) -> bool {
        *self.ctx.shutdown.borrow()
    }

    fn log_request(&self, request: &Request) {
        info!(
            target: ACCESS_LOG_TARGET,
            "{} - - [{}] \"{} {} {:?}\"",
            self.peer.ip(),
            chrono::Utc::now().timestamp(),
            request.method(),
            request.uri(),
            request.version()
        );
    }

    fn log_response(&self, response: &Response) {
        info!(
            target: ACCESS_LOG_TARGET,
            " {} {}",
            response.status().as_u16(),
            response.body()
        );
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // a dropped sender means the server is gone; treat as shutdown
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// End-of-stream conditions that are not worth a warning
fn is_disconnect(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        err.kind(),
        UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected
    )
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
