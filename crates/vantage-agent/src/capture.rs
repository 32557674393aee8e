//! Screen capture task.
//!
//! Capture itself is delegated to platform tools; this module owns the
//! cadence and the single-task invariant. Frames go out as binary
//! WebSocket messages tagged with the screen channel byte. A failed grab
//! skips that frame; a failed write ends the task (the session is gone).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};
use vantage_proto::{write_client_frame, Opcode, CHANNEL_SCREEN};

use crate::error::AgentError;
use crate::runtime::SharedWriter;

/// Target frame cadence (~10 FPS).
const CAPTURE_INTERVAL: Duration = Duration::from_millis(100);

/// Owns the running flag and stop signal for the capture task.
pub struct CaptureControl {
    running: Arc<AtomicBool>,
    stop: Mutex<Option<watch::Sender<bool>>>,
}

impl CaptureControl {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            stop: Mutex::new(None),
        }
    }

    /// Begin capturing. A second start while running is a no-op.
    pub async fn start(&self, writer: SharedWriter, display: Arc<AtomicU32>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.stop.lock().await = Some(stop_tx);

        info!("starting screen capture");

        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CAPTURE_INTERVAL);

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        let frame = match capture_screen(display.load(Ordering::Relaxed)).await {
                            Ok(jpeg) => {
                                let mut frame = Vec::with_capacity(1 + jpeg.len());
                                frame.push(CHANNEL_SCREEN);
                                frame.extend_from_slice(&jpeg);
                                frame
                            }
                            Err(e) => {
                                debug!(error = %e, "capture failed, skipping frame");
                                continue;
                            }
                        };

                        let mut w = writer.lock().await;
                        if write_client_frame(&mut *w, Opcode::Binary, &frame).await.is_err() {
                            break;
                        }
                    }
                }
            }

            running.store(false, Ordering::SeqCst);
        });
    }

    /// Signal the capture task to stop.
    pub async fn stop(&self) {
        if let Some(stop_tx) = self.stop.lock().await.take() {
            let _ = stop_tx.send(true);
            info!("stopped screen capture");
        }
    }
}

impl Default for CaptureControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Grab one JPEG frame of `display` via the platform screenshot tool.
async fn capture_screen(display: u32) -> Result<Vec<u8>, AgentError> {
    let tmp = temp_frame_path();
    let result = run_capture_tool(display, &tmp).await;
    let data = match result {
        Ok(()) => tokio::fs::read(&tmp).await.map_err(AgentError::Io),
        Err(e) => Err(e),
    };
    let _ = tokio::fs::remove_file(&tmp).await;
    data
}

fn temp_frame_path() -> std::path::PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("screen_{}_{nanos}.jpg", std::process::id()))
}

#[cfg(target_os = "macos")]
async fn run_capture_tool(display: u32, out: &std::path::Path) -> Result<(), AgentError> {
    let status = Command::new("screencapture")
        .args(["-x", "-t", "jpg", "-C", "-D"])
        .arg(display.to_string())
        .arg(out)
        .status()
        .await?;
    if !status.success() {
        return Err(AgentError::Capture("screencapture failed".into()));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
async fn run_capture_tool(_display: u32, out: &std::path::Path) -> Result<(), AgentError> {
    // Try the common screenshot tools in order of likelihood.
    for (tool, args) in [
        ("gnome-screenshot", vec!["-f"]),
        ("scrot", vec!["-o"]),
        ("import", vec!["-window", "root"]),
    ] {
        let status = Command::new(tool).args(&args).arg(out).status().await;
        if matches!(status, Ok(s) if s.success()) {
            return Ok(());
        }
    }
    Err(AgentError::Capture("no screenshot tool available".into()))
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
async fn run_capture_tool(_display: u32, _out: &std::path::Path) -> Result<(), AgentError> {
    Err(AgentError::Capture(format!(
        "unsupported platform: {}",
        std::env::consts::OS
    )))
}
