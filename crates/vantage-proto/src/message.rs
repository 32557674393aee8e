//! Message envelope and registration types.
//!
//! Every text frame carries a `{"type": "...", "payload": ...}` envelope;
//! `payload` is omitted for tagless messages (`heartbeat`, `start_capture`,
//! `stop_capture`). Binary frames carry a one-byte channel tag instead.

use serde::{Deserialize, Serialize};

/// First byte of a binary frame: JPEG screen-capture data.
pub const CHANNEL_SCREEN: u8 = 0x01;
/// First byte of a binary frame: file-transfer chunk (reserved).
pub const CHANNEL_FILE: u8 = 0x02;
/// First byte of a binary frame: audio stream chunk (reserved).
pub const CHANNEL_AUDIO: u8 = 0x03;

/// The envelope for all text messages exchanged between agents, the broker,
/// and viewers.
///
/// Message types the broker does not understand deserialize to `Unknown`
/// and are dropped by the handlers; relayed messages (`input`,
/// `switch_display`, `display_switched`) are forwarded as the original raw
/// bytes, never re-serialized from this enum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    Register(Registration),
    Registered(Registered),
    Heartbeat,
    StartCapture,
    StopCapture,
    Input(serde_json::Value),
    SwitchDisplay(SwitchDisplay),
    DisplaySwitched(DisplaySwitched),
    #[serde(other)]
    Unknown,
}

/// Server acknowledgement of a successful registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Registered {
    pub id: String,
}

/// Viewer request to switch the captured display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SwitchDisplay {
    pub display: u32,
}

/// Agent confirmation that the captured display changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisplaySwitched {
    pub display: u32,
    pub display_count: u32,
}

/// A single connected display.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DisplayInfo {
    pub index: u32,
    pub width: u32,
    pub height: u32,
}

/// The wire format sent by the agent during registration: the credential
/// plus everything the agent can discover about its host. Shared between
/// agent (serialization) and broker (deserialization) to keep the two
/// sides in sync.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Registration {
    pub credential: String,
    pub name: String,
    pub hostname: String,
    pub os: String,
    pub os_version: String,
    pub arch: String,
    pub cpu_count: u32,
    pub memory_total: u64,
    pub memory_free: u64,
    pub disk_total: u64,
    pub disk_free: u64,
    pub displays: Vec<DisplayInfo>,
    pub display_count: u32,
    pub local_ips: Vec<String>,
    pub username: String,
    pub uptime_seconds: i64,
    pub agent_version: String,
}
