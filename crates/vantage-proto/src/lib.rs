//! Vantage Wire Protocol
//!
//! Shared message types and WebSocket framing used by the broker and the
//! agent:
//! - RFC 6455 frame reader/writer (single-fragment, server and client roles)
//! - Handshake accept-key computation
//! - The `{"type": ..., "payload": ...}` message envelope
//! - Registration payload and binary channel tags

pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;

pub use error::ProtocolError;
pub use frame::{read_frame, write_client_frame, write_server_frame, Opcode};
pub use handshake::{accept_key, client_key};
pub use message::{
    DisplayInfo, DisplaySwitched, Envelope, Registered, Registration, SwitchDisplay,
    CHANNEL_AUDIO, CHANNEL_FILE, CHANNEL_SCREEN,
};
