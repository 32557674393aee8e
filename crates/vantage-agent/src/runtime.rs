//! The agent session: register, heartbeat, dispatch.
//!
//! One `run()` call is one connection lifetime. The caller loops: on any
//! failure the connection is torn down and redialed after a fixed delay.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use vantage_proto::{
    read_frame, write_client_frame, DisplaySwitched, Envelope, Opcode, Registered,
};

use crate::capture::CaptureControl;
use crate::config::AgentConfig;
use crate::conn::{self, AgentWriter};
use crate::error::AgentError;
use crate::{input, sysinfo};

/// Keep-alive period for the server connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Connection writer shared between the dispatch loop, the heartbeat
/// task, and the capture task. Frames are written whole under the lock.
pub type SharedWriter = Arc<Mutex<AgentWriter>>;

pub struct Agent {
    config: AgentConfig,
    name: Option<String>,
    tls: Option<Arc<ClientConfig>>,
    capture: Arc<CaptureControl>,
    current_display: Arc<AtomicU32>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        name: Option<String>,
        insecure: bool,
    ) -> Result<Self, AgentError> {
        let tls = conn::build_tls_config(&config, insecure)?;
        Ok(Self {
            config,
            name,
            tls,
            capture: Arc::new(CaptureControl::new()),
            current_display: Arc::new(AtomicU32::new(1)),
        })
    }

    /// Dial, register, and serve one connection until it fails or closes.
    pub async fn run(&self) -> Result<(), AgentError> {
        let (mut reader, writer) = conn::dial(&self.config.server_url, self.tls.as_ref()).await?;
        info!("connected to server");

        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        self.current_display.store(1, Ordering::Relaxed);

        self.register(&writer).await?;

        let (opcode, data) = read_frame(&mut reader).await?;
        if opcode != Opcode::Text {
            return Err(AgentError::Registration(format!(
                "unexpected response opcode: {opcode:?}"
            )));
        }
        match serde_json::from_slice::<Envelope>(&data) {
            Ok(Envelope::Registered(Registered { id })) => {
                info!(agent_id = %id, "registration confirmed");
            }
            _ => return Err(AgentError::Registration("registration not confirmed".into())),
        }

        let (stop_heartbeat, heartbeat_signal) = watch::channel(false);
        spawn_heartbeat(Arc::clone(&writer), heartbeat_signal);

        let result = self.message_loop(&mut reader, &writer).await;

        let _ = stop_heartbeat.send(true);
        self.capture.stop().await;
        result
    }

    /// Send the registration envelope: system information plus the
    /// enrollment credential.
    async fn register(&self, writer: &SharedWriter) -> Result<(), AgentError> {
        let mut registration = sysinfo::collect(self.name.as_deref());
        registration.credential = self.config.credential.clone();
        send_envelope(writer, &Envelope::Register(registration)).await
    }

    async fn message_loop(
        &self,
        reader: &mut conn::AgentReader,
        writer: &SharedWriter,
    ) -> Result<(), AgentError> {
        loop {
            let (opcode, data) = read_frame(reader).await?;

            match opcode {
                Opcode::Close => return Ok(()),
                Opcode::Ping => {
                    let mut w = writer.lock().await;
                    write_client_frame(&mut *w, Opcode::Pong, &data).await?;
                }
                Opcode::Text => self.dispatch(&data, writer).await?,
                Opcode::Binary | Opcode::Continuation | Opcode::Pong => {}
            }
        }
    }

    async fn dispatch(&self, data: &[u8], writer: &SharedWriter) -> Result<(), AgentError> {
        let envelope = match serde_json::from_slice::<Envelope>(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "failed to parse server message");
                return Ok(());
            }
        };

        match envelope {
            Envelope::StartCapture => {
                self.capture
                    .start(Arc::clone(writer), Arc::clone(&self.current_display))
                    .await;
            }
            Envelope::StopCapture => self.capture.stop().await,
            Envelope::Input(payload) => input::handle_input(&payload).await,
            Envelope::SwitchDisplay(req) => self.switch_display(req.display, writer).await?,
            other => debug!(message = ?other, "ignoring server message"),
        }
        Ok(())
    }

    /// Bounds-check a display switch, apply it, and echo the result.
    async fn switch_display(
        &self,
        requested_display: u32,
        writer: &SharedWriter,
    ) -> Result<(), AgentError> {
        let display_count = sysinfo::display_count();
        if requested_display < 1 || requested_display > display_count {
            warn!(display = requested_display, display_count, "invalid display number");
            return Ok(());
        }

        self.current_display
            .store(requested_display, Ordering::Relaxed);
        info!(display = requested_display, "switched display");

        send_envelope(
            writer,
            &Envelope::DisplaySwitched(DisplaySwitched {
                display: requested_display,
                display_count,
            }),
        )
        .await
    }
}

/// Marshal and send an envelope as a masked text frame.
pub async fn send_envelope(writer: &SharedWriter, envelope: &Envelope) -> Result<(), AgentError> {
    let data = serde_json::to_vec(envelope)?;
    let mut w = writer.lock().await;
    write_client_frame(&mut *w, Opcode::Text, &data).await?;
    Ok(())
}

/// Emit `heartbeat` every 30 s until the connection goes away.
fn spawn_heartbeat(writer: SharedWriter, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(HEARTBEAT_INTERVAL);
        timer.tick().await; // Skip the immediate first tick.

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if send_envelope(&writer, &Envelope::Heartbeat).await.is_err() {
                        return;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });
}
