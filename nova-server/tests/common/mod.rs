//! Shared helpers for integration tests: fixture paths, a TLS client that
//! trusts the fixture CA, and a minimal HTTP/1.1 response reader.

#![allow(dead_code)]

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nova_server::http::ParseLimits;
use nova_server::{ServerConfig, SessionTimeouts};
use rustls::crypto::ring::default_provider;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

pub fn fixtures() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

/// Loopback, ephemeral port, short timeouts
pub fn server_config() -> ServerConfig {
    let fixtures = fixtures();
    ServerConfig {
        address: "127.0.0.1".into(),
        port: 0,
        threads: 2,
        certificate_file: fixtures.join("server.pem"),
        private_key_file: fixtures.join("server.key"),
        dh_params_file: fixtures.join("dhparams.pem"),
        timeouts: SessionTimeouts {
            handshake: Duration::from_secs(5),
            read_write: Duration::from_secs(5),
            shutdown: Duration::from_secs(1),
        },
        limits: ParseLimits::default(),
        graceful_shutdown_timeout: Duration::from_secs(3),
        shutdown_check_interval: Duration::from_millis(50),
    }
}

pub fn client_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

pub fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    let mut reader = BufReader::new(File::open(fixtures().join("ca.pem")).unwrap());
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert.unwrap()).unwrap();
    }

    let config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

pub async fn connect(addr: SocketAddr) -> TlsStream<TcpStream> {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    tls_connector().connect(name, tcp).await.unwrap()
}

pub async fn send(stream: &mut TlsStream<TcpStream>, raw: &str) {
    stream.write_all(raw.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();
}

pub struct ClientResponse {
    pub status: u16,
    pub head: String,
    pub body: serde_json::Value,
}

impl ClientResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }
}

/// Read one Content-Length framed response; `None` once the server closed
pub async fn read_response(
    stream: &mut TlsStream<TcpStream>,
    pending: &mut Vec<u8>,
) -> Option<ClientResponse> {
    loop {
        if let Some(end) = pending.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8(pending[..end].to_vec()).unwrap();
            let length: usize = head
                .lines()
                .find_map(|line| {
                    let (key, value) = line.split_once(':')?;
                    key.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse().unwrap())
                })
                .unwrap_or(0);
            let total = end + 4 + length;
            if pending.len() >= total {
                let body = serde_json::from_slice(&pending[end + 4..total]).unwrap();
                let status = head[9..12].parse().unwrap();
                pending.drain(..total);
                return Some(ClientResponse { status, head, body });
            }
        }

        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => pending.extend_from_slice(&chunk[..n]),
        }
    }
}
