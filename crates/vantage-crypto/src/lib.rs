//! Vantage Crypto Library
//!
//! Security primitives for the broker and agent:
//!
//! - **HMAC**: hand-rolled HMAC-SHA-512 with constant-time comparison
//! - **Identity**: long-lived Ed25519 platform keypair with an
//!   HKDF-SHA-512-derived symmetric credential-signing key
//! - **Credentials**: `v1.<agent_id>.<mac_hex>` sign/verify
//! - **Tokens**: enrollment codes and API keys, with normalization and
//!   hashing helpers

pub mod credential;
pub mod error;
pub mod hmac;
pub mod identity;
pub mod token;

pub use credential::{credential_hash, CredentialError};
pub use error::CryptoError;
pub use hmac::{constant_time_eq, hmac_sha512, random_bytes, sha256_hex};
pub use identity::Platform;
pub use token::{
    derive_agent_id, generate_api_key, generate_enrollment, hash_api_key, hash_enrollment_code,
    normalize_code, ApiKeyGrant, EnrollmentGrant, TokenType,
};
