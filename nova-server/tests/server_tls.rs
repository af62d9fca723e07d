//! End-to-end tests: real sockets, real TLS, the server's own scheduler

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::StatusCode;
use nova_server::db::{ConnectionPool, MemoryConnector, PoolConfig};
use nova_server::http::success_response;
use nova_server::routes::register_builtin_routes;
use nova_server::tls::TlsError;
use nova_server::{
    Handler, Request, Response, Router, Server, ServerError, ShutdownOutcome,
};
use serde_json::json;

use common::{client_runtime, connect, read_response, send, server_config};

struct Counting(AtomicUsize);

#[async_trait]
impl Handler for Counting {
    async fn handle_request(&self, request: &Request) -> anyhow::Result<Response> {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(success_response(
            Some(json!({ "count": n, "path": request.uri().path() })),
            StatusCode::OK,
            None,
        ))
    }
}

struct Sleeping(Duration);

#[async_trait]
impl Handler for Sleeping {
    async fn handle_request(&self, _request: &Request) -> anyhow::Result<Response> {
        tokio::time::sleep(self.0).await;
        Ok(success_response(None, StatusCode::OK, Some("slept")))
    }
}

/// Blocks its worker thread, as a handler calling a synchronous driver would
struct Blocking {
    delay: Duration,
    started: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl Handler for Blocking {
    async fn handle_request(&self, _request: &Request) -> anyhow::Result<Response> {
        self.started.store(true, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.finished.store(true, Ordering::SeqCst);
        Ok(success_response(None, StatusCode::OK, Some("done")))
    }
}

fn server_with(path: &str, handler: Arc<dyn Handler>, config: nova_server::ServerConfig) -> Server {
    let router = Router::new();
    router.register_handler(path, handler);
    let mut server = Server::builder(config)
        .unwrap()
        .build(Arc::new(router))
        .unwrap();
    server.start().unwrap();
    server
}

#[test]
fn keep_alive_requests_share_one_session() {
    let mut server = server_with(
        "/api/v1/count",
        Arc::new(Counting(AtomicUsize::new(0))),
        server_config(),
    );
    let addr = server.local_addr().unwrap();

    client_runtime().block_on(async {
        let mut stream = connect(addr).await;
        let mut pending = Vec::new();

        send(&mut stream, "GET /api/v1/count HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        let first = read_response(&mut stream, &mut pending).await.unwrap();
        assert_eq!(first.status, 200);
        assert_eq!(first.header("connection"), Some("keep-alive"));
        assert_eq!(first.body["data"]["count"], 1);

        send(&mut stream, "GET /api/v1/count/again HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        let second = read_response(&mut stream, &mut pending).await.unwrap();
        assert_eq!(second.body["data"]["count"], 2);
        assert_eq!(second.body["data"]["path"], "/api/v1/count/again");

        assert_eq!(server.active_sessions(), 1);
    });

    assert_eq!(server.stop(), ShutdownOutcome::Graceful);
}

#[test]
fn unknown_endpoint_gets_404_envelope() {
    let mut server = server_with(
        "/api/v1/count",
        Arc::new(Counting(AtomicUsize::new(0))),
        server_config(),
    );
    let addr = server.local_addr().unwrap();

    client_runtime().block_on(async {
        let mut stream = connect(addr).await;
        let mut pending = Vec::new();

        send(&mut stream, "GET /api/v1/missing HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        let response = read_response(&mut stream, &mut pending).await.unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.body["code"], "ENDPOINT_NOT_FOUND");
        assert_eq!(response.header("server"), Some("Nova Chat Server"));
        assert_eq!(response.header("access-control-allow-origin"), Some("*"));

        assert!(read_response(&mut stream, &mut pending).await.is_none());
    });

    server.stop();
}

#[test]
fn silent_client_is_disconnected_after_read_timeout() {
    let mut config = server_config();
    config.timeouts.read_write = Duration::from_secs(1);
    let mut server = server_with("/api/v1/count", Arc::new(Counting(AtomicUsize::new(0))), config);
    let addr = server.local_addr().unwrap();

    let waited = client_runtime().block_on(async {
        let mut stream = connect(addr).await;
        let started = Instant::now();
        assert!(read_response(&mut stream, &mut Vec::new()).await.is_none());
        started.elapsed()
    });

    assert!(waited >= Duration::from_millis(900), "closed early: {:?}", waited);
    assert!(waited < Duration::from_secs(4), "closed late: {:?}", waited);
    server.stop();
}

#[test]
fn stop_waits_for_in_flight_request() {
    let mut server = server_with(
        "/api/v1/slow",
        Arc::new(Sleeping(Duration::from_millis(800))),
        server_config(),
    );
    let addr = server.local_addr().unwrap();

    let client = std::thread::spawn(move || {
        client_runtime().block_on(async {
            let mut stream = connect(addr).await;
            let mut pending = Vec::new();
            send(&mut stream, "GET /api/v1/slow HTTP/1.1\r\n\r\n").await;
            read_response(&mut stream, &mut pending).await
        })
    });

    wait_for_session(&server);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(server.stop(), ShutdownOutcome::Graceful);
    assert!(!server.is_running());

    let response = client.join().unwrap().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.header("connection"), Some("close"));
}

#[test]
fn stop_forces_shutdown_after_grace_window() {
    let mut config = server_config();
    config.graceful_shutdown_timeout = Duration::from_millis(500);
    let mut server = server_with("/api/v1/slow", Arc::new(Sleeping(Duration::from_secs(30))), config);
    let addr = server.local_addr().unwrap();

    let client = std::thread::spawn(move || {
        client_runtime().block_on(async {
            let mut stream = connect(addr).await;
            send(&mut stream, "GET /api/v1/slow HTTP/1.1\r\n\r\n").await;
            read_response(&mut stream, &mut Vec::new()).await
        })
    });

    wait_for_session(&server);
    std::thread::sleep(Duration::from_millis(200));
    let started = Instant::now();
    assert_eq!(server.stop(), ShutdownOutcome::Forced);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!server.is_running());

    assert!(client.join().unwrap().is_none());
}

#[test]
fn forced_stop_joins_worker_stuck_in_blocking_handler() {
    let mut config = server_config();
    config.graceful_shutdown_timeout = Duration::from_millis(300);
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let handler = Blocking {
        delay: Duration::from_secs(3),
        started: Arc::clone(&started),
        finished: Arc::clone(&finished),
    };
    let mut server = server_with("/api/v1/blocking", Arc::new(handler), config);
    let addr = server.local_addr().unwrap();

    let client = std::thread::spawn(move || {
        client_runtime().block_on(async {
            let mut stream = connect(addr).await;
            send(&mut stream, "GET /api/v1/blocking HTTP/1.1\r\n\r\n").await;
            read_response(&mut stream, &mut Vec::new()).await
        })
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while !started.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "handler never ran");
        std::thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(server.stop(), ShutdownOutcome::Forced);
    assert!(
        finished.load(Ordering::SeqCst),
        "stop returned while a worker was still inside the handler"
    );
    assert!(!server.is_running());

    client.join().unwrap();
}

#[test]
fn missing_tls_files_abort_construction() {
    let mut config = server_config();
    config.certificate_file = common::fixtures().join("missing.pem");

    let err = Server::builder(config)
        .unwrap()
        .build(Arc::new(Router::new()))
        .err()
        .unwrap();

    assert!(matches!(
        err,
        ServerError::Tls(TlsError::MissingFile {
            what: "SSL certificate file",
            ..
        })
    ));
}

#[test]
fn health_endpoint_over_tls() {
    let builder = Server::builder(server_config()).unwrap();
    let pool = builder
        .block_on(ConnectionPool::new(
            Arc::new(MemoryConnector::new()),
            PoolConfig {
                max_connections: 2,
                ..PoolConfig::default()
            },
        ))
        .unwrap();
    assert!(builder.block_on(pool.health_check()));

    let router = Router::new();
    register_builtin_routes(&router, &pool);
    let mut server = builder.build(Arc::new(router)).unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    client_runtime().block_on(async {
        let mut stream = connect(addr).await;
        let mut pending = Vec::new();

        send(&mut stream, "GET /api/v1/health HTTP/1.1\r\n\r\n").await;
        let ok = read_response(&mut stream, &mut pending).await.unwrap();
        assert_eq!(ok.status, 200);
        assert_eq!(ok.body["status"], "success");
        assert_eq!(ok.body["data"]["database"]["max_connections"], 2);

        send(&mut stream, "DELETE /api/v1/health HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        let rejected = read_response(&mut stream, &mut pending).await.unwrap();
        assert_eq!(rejected.status, 405);
    });

    assert_eq!(server.stop(), ShutdownOutcome::Graceful);
}

#[test]
fn dropping_running_server_stops_it() {
    let server = server_with(
        "/api/v1/count",
        Arc::new(Counting(AtomicUsize::new(0))),
        server_config(),
    );
    let addr = server.local_addr().unwrap();
    drop(server);

    let refused = client_runtime().block_on(tokio::net::TcpStream::connect(addr));
    assert!(refused.is_err());
}

fn wait_for_session(server: &Server) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.active_sessions() == 0 {
        assert!(Instant::now() < deadline, "client never connected");
        std::thread::sleep(Duration::from_millis(10));
    }
}
