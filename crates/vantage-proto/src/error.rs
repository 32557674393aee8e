//! Error types for the wire protocol.

use thiserror::Error;

/// Errors produced while reading or writing protocol frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown opcode: {0:#x}")]
    UnknownOpcode(u8),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u64),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
