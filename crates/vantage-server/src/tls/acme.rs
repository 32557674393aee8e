//! ACME certificate management.
//!
//! Uses TLS-ALPN-01 challenges so everything happens on the main
//! listener: the cert resolver answers challenge handshakes itself, and a
//! background task drives order placement and renewal. Certificates and
//! account keys are cached under `<data>/acme-certs`.

use std::path::Path;

use rustls::ServerConfig;
use rustls_acme::acme::ACME_TLS_ALPN_NAME;
use rustls_acme::caches::DirCache;
use rustls_acme::AcmeConfig;
use tokio_stream::StreamExt;
use tracing::{error, info};

use super::{tls13_builder, TlsError};

/// Build a server config whose certificates are managed by ACME, and
/// spawn the renewal task. The host allow-list is restricted to
/// `domains`.
pub fn build(domains: &[String], cache_dir: &Path) -> Result<ServerConfig, TlsError> {
    std::fs::create_dir_all(cache_dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(cache_dir, std::fs::Permissions::from_mode(0o700))?;
    }

    let mut state = AcmeConfig::new(domains.to_vec())
        .cache(DirCache::new(cache_dir.to_path_buf()))
        .directory_lets_encrypt(true)
        .state();

    let resolver = state.resolver();

    tokio::spawn(async move {
        loop {
            match state.next().await {
                Some(Ok(event)) => info!(event = ?event, "ACME event"),
                Some(Err(e)) => error!(error = %e, "ACME error"),
                None => break,
            }
        }
    });

    let mut config = tls13_builder()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    // acme-tls/1 lets the resolver serve challenge certificates on this
    // same listener.
    config.alpn_protocols = vec![b"http/1.1".to_vec(), ACME_TLS_ALPN_NAME.to_vec()];
    Ok(config)
}
