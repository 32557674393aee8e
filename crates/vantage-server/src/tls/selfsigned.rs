//! Self-signed CA and server certificate generation.
//!
//! First start generates an ECDSA P-384 root CA (10-year validity, path
//! length 1) and a server leaf signed by it. The leaf's SANs cover
//! `localhost`, the machine hostname, the loopback addresses, and every
//! non-loopback interface address, so LAN clients can verify the server
//! without DNS.

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use time::{Duration, OffsetDateTime};
use tracing::info;

use super::{TlsError, TlsPaths};

/// Generate the CA and server certificate files, owner-only permissions.
pub fn generate_certs(paths: &TlsPaths) -> Result<(), TlsError> {
    let now = OffsetDateTime::now_utc();

    let ca_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
        .map_err(|e| TlsError::Generation(e.to_string()))?;
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Constrained(1));
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "Vantage Root CA");
    ca_params
        .distinguished_name
        .push(DnType::OrganizationName, "Vantage CA");
    ca_params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    ca_params.key_usages.push(KeyUsagePurpose::CrlSign);
    ca_params.not_before = now - Duration::hours(1);
    ca_params.not_after = now + Duration::days(10 * 365);

    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(|e| TlsError::Generation(e.to_string()))?;

    let server_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
        .map_err(|e| TlsError::Generation(e.to_string()))?;
    let mut params = CertificateParams::new(collect_sans())
        .map_err(|e| TlsError::Generation(e.to_string()))?;
    params
        .distinguished_name
        .push(DnType::CommonName, "Vantage Server");
    params
        .distinguished_name
        .push(DnType::OrganizationName, "Vantage");
    params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    params.key_usages.push(KeyUsagePurpose::KeyEncipherment);
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);
    params.not_before = now - Duration::hours(1);
    params.not_after = now + Duration::days(2 * 365);

    let issuer = Issuer::from_params(&ca_params, &ca_key);
    let server_cert = params
        .signed_by(&server_key, &issuer)
        .map_err(|e| TlsError::Generation(e.to_string()))?;

    write_secret(&paths.ca_cert, ca_cert.pem().as_bytes())?;
    write_secret(&paths.cert, server_cert.pem().as_bytes())?;
    write_secret(&paths.key, server_key.serialize_pem().as_bytes())?;

    info!(
        ca = %paths.ca_cert.display(),
        cert = %paths.cert.display(),
        key = %paths.key.display(),
        "self-signed TLS certificates generated"
    );

    Ok(())
}

/// Subject alternative names for the server leaf: localhost, the host's
/// own name, both loopbacks, and every address on up, non-loopback
/// interfaces.
fn collect_sans() -> Vec<String> {
    let mut sans = vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ];

    if let Ok(name) = hostname::get() {
        if let Ok(name) = name.into_string() {
            if !name.is_empty() {
                sans.push(name);
            }
        }
    }

    if let Ok(interfaces) = if_addrs::get_if_addrs() {
        for interface in interfaces {
            if interface.is_loopback() {
                continue;
            }
            sans.push(interface.ip().to_string());
        }
    }

    sans.sort();
    sans.dedup();
    sans
}

fn write_secret(path: &std::path::Path, data: &[u8]) -> Result<(), TlsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
