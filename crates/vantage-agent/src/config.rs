//! On-disk agent configuration.
//!
//! Enrollment writes `<config>/vantage/agent.json` (0600) so later starts
//! reconnect without a fresh code. The CA certificate and fingerprint are
//! the ones the broker handed out at enrollment; the agent pins them
//! instead of trusting the system store for self-signed deployments.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub server_url: String,
    pub agent_id: String,
    pub credential: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_fingerprint: Option<String>,
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("vantage")
        .join("agent.json")
}

pub fn load() -> Result<AgentConfig, AgentError> {
    load_from(&config_path())
}

pub fn save(cfg: &AgentConfig) -> Result<(), AgentError> {
    save_to(&config_path(), cfg)
}

fn load_from(path: &Path) -> Result<AgentConfig, AgentError> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

fn save_to(path: &Path, cfg: &AgentConfig) -> Result<(), AgentError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(cfg)?)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
