//! Persistent data models.
//!
//! Timestamps are `DateTime<Utc>` in memory and RFC3339 UTC text (second
//! precision) in the database. Hash columns are never serialized to API
//! responses.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

/// An enrolled agent.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    #[serde(skip_serializing)]
    pub credential_hash: String,
    pub enrolled_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A one-shot enrollment token. Only the hash of the normalized code is
/// kept; the display code exists only in the mint response.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EnrollmentToken {
    pub id: String,
    #[serde(skip_serializing)]
    pub code_hash: String,
    #[serde(rename = "type")]
    pub token_type: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_by: Option<String>,
}

/// A dashboard/API access key. `prefix` is the first 12 characters of the
/// raw key, kept for UI identification.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ApiKey {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub prefix: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

/// Format a timestamp the way the database stores it.
pub fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
