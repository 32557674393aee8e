//! WebSocket dialing: TCP connect, optional TLS, client-side handshake.
//!
//! Trust for `wss://` comes from the CA certificate delivered at
//! enrollment (self-signed deployments), the platform trust store (ACME /
//! custom certificates), or nothing at all with `--insecure`.

use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, RootCertStore, SignatureScheme};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use vantage_proto::client_key;

use crate::config::AgentConfig;
use crate::error::AgentError;

pub trait AgentIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AgentIo for T {}

pub type AgentStream = Box<dyn AgentIo>;
pub type AgentReader = BufReader<ReadHalf<AgentStream>>;
pub type AgentWriter = WriteHalf<AgentStream>;

/// A parsed `ws://` / `wss://` endpoint.
#[derive(Debug, PartialEq)]
pub struct WsUrl {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Verbatim authority for the Host header.
    pub host_header: String,
}

/// Parse a WebSocket URL and append the agent endpoint path.
pub fn parse_ws_url(url: &str) -> Result<WsUrl, AgentError> {
    let (secure, rest) = if let Some(rest) = url.strip_prefix("wss://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("ws://") {
        (false, rest)
    } else {
        return Err(AgentError::Config(format!(
            "server URL must be ws:// or wss://, got {url:?}"
        )));
    };

    let (authority, prefix) = match rest.find('/') {
        Some(i) => (&rest[..i], rest[i..].trim_end_matches('/')),
        None => (rest, ""),
    };
    if authority.is_empty() {
        return Err(AgentError::Config("server URL has no host".into()));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port_str)) => match port_str.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => {
                return Err(AgentError::Config(format!("invalid port in {url:?}")));
            }
        },
        None => (authority.to_string(), if secure { 443 } else { 80 }),
    };

    Ok(WsUrl {
        secure,
        host,
        port,
        path: format!("{prefix}/ws/agent"),
        host_header: authority.to_string(),
    })
}

/// Connect, complete the RFC 6455 client handshake, and hand back the
/// framed stream halves.
pub async fn dial(
    server_url: &str,
    tls: Option<&Arc<ClientConfig>>,
) -> Result<(AgentReader, AgentWriter), AgentError> {
    let endpoint = parse_ws_url(server_url)?;

    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;

    let stream: AgentStream = if endpoint.secure {
        let tls = tls.ok_or_else(|| {
            AgentError::Tls("missing TLS configuration for wss:// URL".into())
        })?;
        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|e| AgentError::Tls(format!("invalid server name: {e}")))?;
        let connected = TlsConnector::from(Arc::clone(tls))
            .connect(server_name, tcp)
            .await
            .map_err(|e| AgentError::Tls(e.to_string()))?;
        Box::new(connected)
    } else {
        Box::new(tcp)
    };

    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        endpoint.path,
        endpoint.host_header,
        client_key(),
    );
    write_half.write_all(request.as_bytes()).await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    if !line.starts_with("HTTP/1.1 101") {
        return Err(AgentError::Handshake(line.trim().to_string()));
    }

    // Consume the remaining response headers.
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(AgentError::Handshake(
                "connection closed during handshake".into(),
            ));
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    Ok((reader, write_half))
}

/// Build the client TLS configuration for `wss://` URLs. Returns `None`
/// for plain `ws://`.
pub fn build_tls_config(
    cfg: &AgentConfig,
    insecure: bool,
) -> Result<Option<Arc<ClientConfig>>, AgentError> {
    if !cfg.server_url.starts_with("wss://") {
        return Ok(None);
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| AgentError::Tls(e.to_string()))?;

    let config = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier::new(&provider)))
            .with_no_client_auth()
    } else if let Some(ca_pem) = &cfg.ca_certificate {
        // Pin the CA received at enrollment.
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
            let cert = cert.map_err(|e| AgentError::Tls(format!("invalid CA cert: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| AgentError::Tls(format!("invalid CA cert: {e}")))?;
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        // ACME / custom certificates verify against the system store.
        let mut roots = RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().certs {
            let _ = roots.add(cert);
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(Some(Arc::new(config)))
}

/// Accepts any server certificate. `--insecure` only.
#[derive(Debug)]
struct InsecureVerifier {
    schemes: Vec<SignatureScheme>,
}

impl InsecureVerifier {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            schemes: provider.signature_verification_algorithms.supported_schemes(),
        }
    }
}

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_url_with_default_port() {
        let u = parse_ws_url("ws://server").unwrap();
        assert!(!u.secure);
        assert_eq!(u.host, "server");
        assert_eq!(u.port, 80);
        assert_eq!(u.path, "/ws/agent");
        assert_eq!(u.host_header, "server");
    }

    #[test]
    fn parse_secure_url_with_port_and_prefix() {
        let u = parse_ws_url("wss://server:8443/broker/").unwrap();
        assert!(u.secure);
        assert_eq!(u.port, 8443);
        assert_eq!(u.path, "/broker/ws/agent");
        assert_eq!(u.host_header, "server:8443");
    }

    #[test]
    fn parse_secure_default_port_is_443() {
        assert_eq!(parse_ws_url("wss://server").unwrap().port, 443);
    }

    #[test]
    fn parse_rejects_other_schemes() {
        assert!(parse_ws_url("https://server").is_err());
        assert!(parse_ws_url("server:8443").is_err());
        assert!(parse_ws_url("ws://").is_err());
    }

    #[test]
    fn plain_ws_needs_no_tls_config() {
        let cfg = AgentConfig {
            server_url: "ws://server:8080".into(),
            agent_id: String::new(),
            credential: String::new(),
            ca_certificate: None,
            platform_fingerprint: None,
        };
        assert!(build_tls_config(&cfg, false).unwrap().is_none());
    }

    #[test]
    fn wss_with_insecure_builds_a_config() {
        let cfg = AgentConfig {
            server_url: "wss://server:8443".into(),
            agent_id: String::new(),
            credential: String::new(),
            ca_certificate: None,
            platform_fingerprint: None,
        };
        assert!(build_tls_config(&cfg, true).unwrap().is_some());
    }
}
