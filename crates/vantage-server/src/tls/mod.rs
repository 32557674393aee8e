//! TLS provisioning.
//!
//! Four modes, selected from the CLI at startup:
//! - **Off** — plain HTTP, development only
//! - **Self-signed** — auto-generated ECDSA P-384 root CA + server leaf,
//!   persisted in the data directory and reused across restarts
//! - **ACME** — certificates acquired and renewed automatically for the
//!   configured domains, cached under the data directory
//! - **Custom** — operator-provided certificate and key
//!
//! Every mode that terminates TLS enforces a TLS 1.3 minimum.

pub mod acme;
pub mod selfsigned;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::ServerConfig;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate generation error: {0}")]
    Generation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid certificate or key: {0}")]
    InvalidPem(String),

    #[error("no private key found in key file")]
    NoPrivateKey,

    #[error("TLS configuration error: {0}")]
    Config(String),
}

/// On-disk locations of the self-signed CA and server certificate files.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub ca_cert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TlsPaths {
    pub fn in_data_dir(data_dir: &std::path::Path) -> Self {
        Self {
            ca_cert: data_dir.join("ca.crt"),
            cert: data_dir.join("server.crt"),
            key: data_dir.join("server.key"),
        }
    }

    fn all_exist(&self) -> bool {
        self.ca_cert.exists() && self.cert.exists() && self.key.exists()
    }
}

/// How the server handles TLS.
#[derive(Debug, Clone)]
pub enum TlsMode {
    /// Plaintext (development only).
    Off,
    /// Auto-generated CA and server certificate stored in the data dir.
    SelfSigned { data_dir: PathBuf },
    /// Automatic certificates for the given domains.
    Acme {
        domains: Vec<String>,
        cache_dir: PathBuf,
    },
    /// Operator-provided certificate and key files.
    Custom { cert: PathBuf, key: PathBuf },
}

/// The built TLS state handed to the accept loop.
pub struct TlsContext {
    pub acceptor: Option<TlsAcceptor>,
    /// Set in self-signed mode; the CA cert is returned at enrollment so
    /// agents can pin it.
    pub paths: Option<TlsPaths>,
}

impl TlsMode {
    pub fn build(&self) -> Result<TlsContext, TlsError> {
        match self {
            Self::Off => {
                warn!("running without TLS (development mode)");
                Ok(TlsContext {
                    acceptor: None,
                    paths: None,
                })
            }
            Self::SelfSigned { data_dir } => {
                let paths = TlsPaths::in_data_dir(data_dir);
                if !paths.all_exist() {
                    selfsigned::generate_certs(&paths)?;
                } else {
                    info!(cert = %paths.cert.display(), "reusing existing TLS certificates");
                }

                let config = load_server_config(&paths.cert, &paths.key)?;
                Ok(TlsContext {
                    acceptor: Some(TlsAcceptor::from(Arc::new(config))),
                    paths: Some(paths),
                })
            }
            Self::Acme { domains, cache_dir } => {
                let config = acme::build(domains, cache_dir)?;
                info!(domains = ?domains, "ACME certificate management enabled");
                Ok(TlsContext {
                    acceptor: Some(TlsAcceptor::from(Arc::new(config))),
                    paths: None,
                })
            }
            Self::Custom { cert, key } => {
                let config = load_server_config(cert, key)?;
                info!(cert = %cert.display(), key = %key.display(), "custom TLS enabled");
                Ok(TlsContext {
                    acceptor: Some(TlsAcceptor::from(Arc::new(config))),
                    paths: None,
                })
            }
        }
    }
}

/// A rustls server config builder pinned to TLS 1.3.
pub(crate) fn tls13_builder(
) -> Result<rustls::ConfigBuilder<ServerConfig, rustls::WantsVerifier>, TlsError> {
    ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TlsError::Config(e.to_string()))
}

/// Load a certificate chain and private key into a TLS 1.3 server config.
fn load_server_config(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
) -> Result<ServerConfig, TlsError> {
    let certs = read_certs(&mut std::io::BufReader::new(std::fs::File::open(cert_path)?))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(std::fs::File::open(
        key_path,
    )?))
    .map_err(|e| TlsError::InvalidPem(e.to_string()))?
    .ok_or(TlsError::NoPrivateKey)?;

    let mut config = tls13_builder()?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Config(e.to_string()))?;

    // The WebSocket upgrade path requires HTTP/1.1.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn read_certs(
    reader: &mut dyn BufRead,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, TlsError> {
    rustls_pemfile::certs(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::InvalidPem(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct TestDir {
        dir: PathBuf,
    }

    impl TestDir {
        fn new() -> Self {
            let dir =
                std::env::temp_dir().join(format!("vantage-tls-test-{}", rand::random::<u64>()));
            std::fs::create_dir_all(&dir).unwrap();
            Self { dir }
        }
    }

    impl Drop for TestDir {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.dir).ok();
        }
    }

    #[test]
    fn off_mode_has_no_acceptor() {
        let ctx = TlsMode::Off.build().unwrap();
        assert!(ctx.acceptor.is_none());
        assert!(ctx.paths.is_none());
    }

    #[tokio::test]
    async fn self_signed_generates_and_reuses_certs() {
        let test_dir = TestDir::new();

        let ctx = TlsMode::SelfSigned {
            data_dir: test_dir.dir.clone(),
        }
        .build()
        .unwrap();
        assert!(ctx.acceptor.is_some());

        let paths = ctx.paths.unwrap();
        assert!(paths.all_exist());

        let ca_pem = std::fs::read_to_string(&paths.ca_cert).unwrap();
        assert!(ca_pem.contains("BEGIN CERTIFICATE"));

        // A second build must reuse the same CA byte-for-byte.
        let again = TlsMode::SelfSigned {
            data_dir: test_dir.dir.clone(),
        }
        .build()
        .unwrap();
        assert!(again.acceptor.is_some());
        assert_eq!(std::fs::read_to_string(&paths.ca_cert).unwrap(), ca_pem);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn self_signed_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let test_dir = TestDir::new();
        let ctx = TlsMode::SelfSigned {
            data_dir: test_dir.dir.clone(),
        }
        .build()
        .unwrap();

        let paths = ctx.paths.unwrap();
        for path in [&paths.ca_cert, &paths.cert, &paths.key] {
            let mode = std::fs::metadata(path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{}", path.display());
        }
    }

    #[test]
    fn custom_mode_rejects_missing_files() {
        let result = TlsMode::Custom {
            cert: PathBuf::from("/nonexistent/cert.pem"),
            key: PathBuf::from("/nonexistent/key.pem"),
        }
        .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn custom_mode_loads_generated_certs() {
        let test_dir = TestDir::new();
        let paths = TlsPaths::in_data_dir(&test_dir.dir);
        selfsigned::generate_certs(&paths).unwrap();

        let ctx = TlsMode::Custom {
            cert: paths.cert.clone(),
            key: paths.key.clone(),
        }
        .build()
        .unwrap();
        assert!(ctx.acceptor.is_some());
        assert!(ctx.paths.is_none());
    }
}
