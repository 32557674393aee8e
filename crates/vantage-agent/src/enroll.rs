//! One-shot enrollment against the broker's HTTP API.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::config::AgentConfig;
use crate::error::AgentError;

#[derive(Debug, Deserialize)]
struct EnrollResponse {
    agent_id: String,
    credential: String,
    #[serde(default)]
    platform_fingerprint: Option<String>,
    #[serde(default)]
    ca_certificate: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ErrorBody {
    error: String,
}

/// POST the enrollment code and host facts; on success the returned
/// config holds everything needed for persistent sessions.
pub async fn enroll(
    server_url: &str,
    code: &str,
    name: Option<&str>,
    insecure: bool,
) -> Result<AgentConfig, AgentError> {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default();
    let name = name.filter(|n| !n.is_empty()).unwrap_or(&hostname);

    let base = normalize_base(server_url);

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(insecure)
        .timeout(Duration::from_secs(30))
        .build()?;

    let response = client
        .post(format!("{base}/api/enroll"))
        .json(&json!({
            "code": code,
            "name": name,
            "hostname": hostname,
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        }))
        .send()
        .await?;

    if !response.status().is_success() {
        let body: ErrorBody = response.json().await.unwrap_or_default();
        let message = if body.error.is_empty() {
            "enrollment rejected".to_string()
        } else {
            body.error
        };
        return Err(AgentError::Enrollment(message));
    }

    let result: EnrollResponse = response.json().await?;

    Ok(AgentConfig {
        server_url: to_ws_url(&base),
        agent_id: result.agent_id,
        credential: result.credential,
        ca_certificate: result.ca_certificate.filter(|c| !c.is_empty()),
        platform_fingerprint: result.platform_fingerprint.filter(|f| !f.is_empty()),
    })
}

/// Ensure an `https://` scheme and no trailing slash.
fn normalize_base(server_url: &str) -> String {
    let base = server_url.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        base.to_string()
    } else {
        format!("https://{base}")
    }
}

fn to_ws_url(base: &str) -> String {
    base.replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1)
}
