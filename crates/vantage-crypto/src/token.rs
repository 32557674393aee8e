//! Enrollment codes and API keys.
//!
//! Enrollment codes are human-typeable one-shot secrets: attended codes
//! are short and short-lived, unattended codes longer and valid for a
//! week. Only SHA-256 hashes of normalized codes are ever stored; the
//! formatted display code is returned exactly once at mint time.

use chrono::{DateTime, Duration, Timelike, Utc};
use rand::RngCore;

use crate::error::CryptoError;
use crate::hmac::sha256_hex;

/// Ambiguity-safe code alphabet: uppercase + digits, minus O/0/I/1/L.
const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Raw prefix on every API key.
const API_KEY_PREFIX: &str = "rmm_";

/// Length of the stored API-key prefix used for UI identification.
const API_KEY_PREFIX_LEN: usize = 12;

/// Enrollment token flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    /// Operator is present: short code, 15-minute expiry.
    Attended,
    /// Mass deployment: long code, 7-day expiry.
    Unattended,
}

impl TokenType {
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        match s {
            "attended" => Ok(Self::Attended),
            "unattended" => Ok(Self::Unattended),
            other => Err(CryptoError::InvalidTokenType(other.to_string())),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Attended => "attended",
            Self::Unattended => "unattended",
        }
    }

    const fn code_len(self) -> usize {
        match self {
            Self::Attended => 8,
            Self::Unattended => 24,
        }
    }

    fn ttl(self) -> Duration {
        match self {
            Self::Attended => Duration::minutes(15),
            Self::Unattended => Duration::days(7),
        }
    }
}

/// A freshly minted enrollment token. `display_code` is the only copy of
/// the secret; the store keeps `code_hash`.
#[derive(Debug, Clone)]
pub struct EnrollmentGrant {
    pub id: String,
    pub code_hash: String,
    pub token_type: TokenType,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub display_code: String,
}

/// A freshly minted API key. `raw_key` is the only copy of the secret.
#[derive(Debug, Clone)]
pub struct ApiKeyGrant {
    pub id: String,
    pub name: String,
    pub key_hash: String,
    pub prefix: String,
    pub created_at: DateTime<Utc>,
    pub raw_key: String,
}

/// Mint an enrollment token of the given type.
pub fn generate_enrollment(token_type: TokenType, label: &str) -> EnrollmentGrant {
    let code = random_code(token_type.code_len());
    let now = now_utc();

    EnrollmentGrant {
        id: random_hex(8),
        code_hash: sha256_hex(code.as_bytes()),
        token_type,
        label: label.to_string(),
        created_at: now,
        expires_at: now + token_type.ttl(),
        display_code: format_code(&code),
    }
}

/// Mint an API key (`rmm_<64 hex>`).
pub fn generate_api_key(name: &str) -> ApiKeyGrant {
    let mut raw = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    let key = format!("{API_KEY_PREFIX}{}", hex::encode(raw));

    ApiKeyGrant {
        id: random_hex(8),
        name: name.to_string(),
        key_hash: sha256_hex(key.as_bytes()),
        prefix: key[..API_KEY_PREFIX_LEN].to_string(),
        created_at: now_utc(),
        raw_key: key,
    }
}

/// Normalize a typed enrollment code: strip dashes and all whitespace,
/// uppercase. Hashing always goes through this.
pub fn normalize_code(code: &str) -> String {
    code.chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Normalize and hash an enrollment code for store lookup.
pub fn hash_enrollment_code(code: &str) -> String {
    sha256_hex(normalize_code(code).as_bytes())
}

/// SHA-256 hex of an API key for store lookup.
pub fn hash_api_key(key: &str) -> String {
    sha256_hex(key.as_bytes())
}

/// Deterministic agent ID: first 16 hex chars of
/// SHA-256(code ∥ platform fingerprint), over the code exactly as the
/// agent submitted it. Only token lookup normalizes; a retry of the same
/// submission lands on the same id.
pub fn derive_agent_id(code: &str, fingerprint: &str) -> String {
    let digest = sha256_hex(format!("{code}{fingerprint}").as_bytes());
    digest[..16].to_string()
}

/// Current UTC time truncated to whole seconds, the precision every
/// persisted timestamp carries.
pub fn now_utc() -> DateTime<Utc> {
    let now = Utc::now();
    now.with_nanosecond(0).unwrap_or(now)
}

fn random_code(length: usize) -> String {
    let mut raw = vec![0u8; length];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    raw.iter()
        .map(|b| TOKEN_ALPHABET[*b as usize % TOKEN_ALPHABET.len()] as char)
        .collect()
}

/// Insert dashes every 4 characters for readability.
fn format_code(code: &str) -> String {
    code.as_bytes()
        .chunks(4)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join("-")
}

fn random_hex(bytes: usize) -> String {
    let mut raw = vec![0u8; bytes];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}
