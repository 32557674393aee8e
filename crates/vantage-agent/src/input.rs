//! Input injection shims.
//!
//! The broker treats input payloads as opaque; this is where they land.
//! Injection is delegated to platform tools and failures are logged and
//! dropped - a missed click must never take down the session.

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct InputEvent {
    kind: String,
    action: String,
    x: i32,
    y: i32,
    button: i32,
    key: String,
    code: i32,
}

/// Dispatch an input payload to the platform handler.
pub async fn handle_input(payload: &serde_json::Value) {
    let event: InputEvent = match serde_json::from_value(payload.clone()) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, "unparseable input payload");
            return;
        }
    };

    match event.kind.as_str() {
        "mouse" => inject_mouse(&event).await,
        "key" => {
            // Inject on keydown only to avoid double-typing.
            if event.action == "down" {
                inject_key(&event).await;
            }
        }
        other => debug!(kind = %other, "unknown input kind"),
    }
}

#[cfg(target_os = "linux")]
async fn inject_mouse(event: &InputEvent) {
    // X11 buttons are 1-based: left/middle/right = 1/2/3.
    let button = (event.button + 1).clamp(1, 3).to_string();
    let x = event.x.to_string();
    let y = event.y.to_string();

    let result = match event.action.as_str() {
        "move" => run("xdotool", &["mousemove", &x, &y]).await,
        "down" => run("xdotool", &["mousemove", &x, &y, "mousedown", &button]).await,
        "up" => run("xdotool", &["mouseup", &button]).await,
        other => {
            debug!(action = %other, "unknown mouse action");
            return;
        }
    };
    if let Err(e) = result {
        debug!(error = %e, "mouse injection failed");
    }
}

#[cfg(target_os = "linux")]
async fn inject_key(event: &InputEvent) {
    if event.key.is_empty() {
        return;
    }
    if let Err(e) = run("xdotool", &["key", "--", &event.key]).await {
        debug!(error = %e, key = %event.key, code = event.code, "key injection failed");
    }
}

#[cfg(target_os = "macos")]
async fn inject_mouse(event: &InputEvent) {
    let point = format!("{},{}", event.x, event.y);
    let result = match event.action.as_str() {
        "move" => run("cliclick", &[&format!("m:{point}")]).await,
        "down" => run("cliclick", &[&format!("dd:{point}")]).await,
        "up" => run("cliclick", &[&format!("du:{point}")]).await,
        other => {
            debug!(action = %other, "unknown mouse action");
            return;
        }
    };
    if let Err(e) = result {
        debug!(error = %e, "mouse injection failed");
    }
}

#[cfg(target_os = "macos")]
async fn inject_key(event: &InputEvent) {
    if event.key.is_empty() {
        return;
    }
    let script = format!(
        "tell application \"System Events\" to keystroke \"{}\"",
        event.key.replace('\\', "\\\\").replace('"', "\\\"")
    );
    if let Err(e) = run("osascript", &["-e", &script]).await {
        debug!(error = %e, "key injection failed");
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
async fn inject_mouse(_event: &InputEvent) {
    debug!(os = std::env::consts::OS, "mouse injection not supported");
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
async fn inject_key(_event: &InputEvent) {
    debug!(os = std::env::consts::OS, "key injection not supported");
}

#[allow(dead_code)]
async fn run(tool: &str, args: &[&str]) -> std::io::Result<()> {
    let status = Command::new(tool).args(args).status().await?;
    if !status.success() {
        return Err(std::io::Error::other(format!("{tool} exited with {status}")));
    }
    Ok(())
}
