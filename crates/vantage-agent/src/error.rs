//! Agent error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("enrollment failed: {0}")]
    Enrollment(String),

    #[error("enrollment request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("registration failed: {0}")]
    Registration(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Protocol(#[from] vantage_proto::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("screen capture unavailable: {0}")]
    Capture(String),
}
