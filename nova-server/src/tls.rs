//! TLS context construction from PEM files on disk

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::ring::default_provider;
use rustls::ServerConfig;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

const DH_PARAMS_MARKER: &str = "-----BEGIN DH PARAMETERS-----";

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("{what} not found: {path:?}")]
    MissingFile { what: &'static str, path: PathBuf },

    #[error("Cannot read {what} {path:?}: {source}")]
    Io {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No certificates found in {0:?}")]
    NoCertificates(PathBuf),

    #[error("No private key found in {0:?}")]
    NoPrivateKey(PathBuf),

    #[error("Invalid DH parameters file {0:?}")]
    InvalidDhParams(PathBuf),

    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),
}

/// Build the server-side TLS acceptor (TLS 1.2 and 1.3, no client auth).
///
/// All three files must exist. rustls negotiates ECDHE only, so the DH
/// parameters file is checked for presence and format but never used for
/// key exchange.
pub fn load_acceptor(
    certificate_file: &Path,
    private_key_file: &Path,
    dh_params_file: &Path,
) -> Result<TlsAcceptor, TlsError> {
    let certs = {
        let mut reader = open("SSL certificate file", certificate_file)?;
        rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| TlsError::Io {
                what: "SSL certificate file",
                path: certificate_file.to_path_buf(),
                source,
            })?
    };
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(certificate_file.to_path_buf()));
    }

    let key = {
        let mut reader = open("SSL private key file", private_key_file)?;
        rustls_pemfile::private_key(&mut reader)
            .map_err(|source| TlsError::Io {
                what: "SSL private key file",
                path: private_key_file.to_path_buf(),
                source,
            })?
            .ok_or_else(|| TlsError::NoPrivateKey(private_key_file.to_path_buf()))?
    };

    check_dh_params(dh_params_file)?;

    let config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    tracing::debug!(
        certificate = %certificate_file.display(),
        "TLS context initialized"
    );
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn open(what: &'static str, path: &Path) -> Result<BufReader<File>, TlsError> {
    if !path.exists() {
        return Err(TlsError::MissingFile {
            what,
            path: path.to_path_buf(),
        });
    }
    let file = File::open(path).map_err(|source| TlsError::Io {
        what,
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufReader::new(file))
}

fn check_dh_params(path: &Path) -> Result<(), TlsError> {
    const WHAT: &str = "SSL DH params file";

    if !path.exists() {
        return Err(TlsError::MissingFile {
            what: WHAT,
            path: path.to_path_buf(),
        });
    }
    let content = std::fs::read_to_string(path).map_err(|source| TlsError::Io {
        what: WHAT,
        path: path.to_path_buf(),
        source,
    })?;
    if !content.contains(DH_PARAMS_MARKER) {
        return Err(TlsError::InvalidDhParams(path.to_path_buf()));
    }
    Ok(())
}
