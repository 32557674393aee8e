//! Agent credential format: `v1.<agent_id>.<hmac_sha512_hex>`.
//!
//! The MAC covers `"agent-credential:" + agent_id` under the platform's
//! derived credential key. The `v1.` prefix is the sole extensibility
//! point; a future version can switch the MAC scheme without changing the
//! parse shape.

use thiserror::Error;

use crate::hmac::{constant_time_eq, hmac_sha512, sha256_hex};
use crate::identity::Platform;

/// Domain-separation prefix for the credential MAC input.
const MAC_CONTEXT: &str = "agent-credential:";

/// Credential verification failures. None of these reach the wire; agents
/// presenting a bad credential are closed silently.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("unsupported credential version")]
    UnsupportedVersion,

    #[error("malformed credential")]
    Malformed,

    #[error("invalid credential")]
    InvalidMac,
}

impl Platform {
    /// Produce a versioned credential for `agent_id`.
    pub fn sign_credential(&self, agent_id: &str) -> String {
        let mac = hmac_sha512(
            &self.cred_key,
            format!("{MAC_CONTEXT}{agent_id}").as_bytes(),
        );
        format!("v1.{agent_id}.{}", hex::encode(mac))
    }

    /// Verify a `v1`-format credential, returning the embedded agent ID.
    pub fn verify_credential(&self, credential: &str) -> Result<String, CredentialError> {
        let rest = credential
            .strip_prefix("v1.")
            .ok_or(CredentialError::UnsupportedVersion)?;

        // Agent IDs never contain dots, but split on the last one so the
        // format stays parseable if that ever changes.
        let (agent_id, mac_hex) = rest.rsplit_once('.').ok_or(CredentialError::Malformed)?;
        if agent_id.is_empty() {
            return Err(CredentialError::Malformed);
        }

        let provided = hex::decode(mac_hex).map_err(|_| CredentialError::Malformed)?;
        let expected = hmac_sha512(
            &self.cred_key,
            format!("{MAC_CONTEXT}{agent_id}").as_bytes(),
        );

        if !constant_time_eq(&provided, &expected) {
            return Err(CredentialError::InvalidMac);
        }

        Ok(agent_id.to_string())
    }
}

/// SHA-256 hex of a raw credential, used for database lookups without
/// storing the credential itself.
pub fn credential_hash(credential: &str) -> String {
    sha256_hex(credential.as_bytes())
}
