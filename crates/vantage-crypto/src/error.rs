//! Error types for the crypto library.

use thiserror::Error;

/// Errors from identity and token operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid platform key file: {0}")]
    InvalidKeyFile(String),

    #[error("platform key file has insecure permissions: {mode:o} (expected 600)")]
    InsecureKeyPermissions { mode: u32 },

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("invalid token type: {0}")]
    InvalidTokenType(String),
}
