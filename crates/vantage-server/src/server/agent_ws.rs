//! Agent WebSocket session lifecycle.
//!
//! After the upgrade, the agent gets one chance (30 s) to present a valid
//! `register` envelope. The credential is verified against the platform
//! key and cross-checked against the enrollment database; any mismatch
//! closes the socket silently. A registered session then loops relaying
//! binary frames to the attached viewer and handling control messages
//! until the connection drops or a newer session evicts it.

use std::time::Duration;

use axum::extract::{Request, State};
use axum::response::Response;
use axum::Extension;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use vantage_crypto::credential_hash;
use vantage_crypto::token::now_utc;
use vantage_proto::{read_frame, Envelope, Opcode, Registered};

use super::upgrade::upgrade_websocket;
use super::{AppState, PeerAddr};
use crate::registry::LiveAgent;

/// How long the server waits for the registration message after the
/// handshake.
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// `GET /ws/agent` — upgrade and hand the stream to the session task.
pub async fn handle_agent(
    State(state): State<AppState>,
    peer: Option<Extension<PeerAddr>>,
    mut req: Request,
) -> Response {
    let ws = match upgrade_websocket(&mut req) {
        Ok(ws) => ws,
        Err(response) => {
            warn!("agent WebSocket upgrade failed");
            return response;
        }
    };

    let remote_addr = peer
        .map(|Extension(PeerAddr(addr))| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    tokio::spawn(async move {
        match ws.on_upgrade.await {
            Ok(upgraded) => agent_session(state, remote_addr, TokioIo::new(upgraded)).await,
            Err(e) => warn!(error = %e, "agent upgrade did not complete"),
        }
    });

    ws.response
}

pub(crate) async fn agent_session<S>(state: AppState, remote_addr: String, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    // AWAIT_REG: exactly one text frame within the deadline.
    let data = match timeout(REGISTRATION_TIMEOUT, read_frame(&mut reader)).await {
        Ok(Ok((Opcode::Text, data))) => data,
        Ok(Ok((opcode, _))) => {
            debug!(?opcode, "agent sent non-text frame before registering");
            return;
        }
        Ok(Err(e)) => {
            debug!(error = %e, "agent read failed before registering");
            return;
        }
        Err(_) => {
            debug!(peer = %remote_addr, "agent registration timed out");
            return;
        }
    };

    let registration = match serde_json::from_slice::<Envelope>(&data) {
        Ok(Envelope::Register(registration)) => registration,
        _ => {
            debug!(peer = %remote_addr, "first agent message was not register");
            return;
        }
    };

    if registration.credential.is_empty() {
        warn!(peer = %remote_addr, "agent rejected: no credential provided");
        return;
    }

    let agent_id = match state.platform.verify_credential(&registration.credential) {
        Ok(agent_id) => agent_id,
        Err(e) => {
            warn!(peer = %remote_addr, error = %e, "agent rejected: invalid credential");
            return;
        }
    };

    // The MAC alone is not enough: the agent must still be enrolled.
    let enrolled = match state
        .store
        .get_agent_by_credential(&credential_hash(&registration.credential))
        .await
    {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!(agent_id = %agent_id, "agent rejected: not enrolled");
            return;
        }
        Err(e) => {
            error!(agent_id = %agent_id, error = %e, "enrollment lookup failed");
            return;
        }
    };

    let (agent, displaced) = state
        .registry
        .register_agent(&enrolled, registration, remote_addr, Box::new(write_half))
        .await;
    if let Some(old) = displaced {
        old.evict();
    }

    info!(
        agent_id = %agent.id,
        name = %agent.registration.name,
        os = %agent.registration.os,
        arch = %agent.registration.arch,
        "agent registered"
    );

    let ack = Envelope::Registered(Registered {
        id: agent.id.clone(),
    });
    if let Err(e) = agent.send_envelope(&ack).await {
        debug!(agent_id = %agent.id, error = %e, "failed to acknowledge registration");
        cleanup(&state, &agent).await;
        return;
    }

    // LIVE: no read deadline from here on; heartbeats keep last_seen fresh.
    let mut closed = agent.close_signal();
    loop {
        // An eviction may have landed before we subscribed to the signal.
        if *closed.borrow_and_update() {
            debug!(agent_id = %agent.id, "agent session evicted by newer registration");
            break;
        }

        tokio::select! {
            result = read_frame(&mut reader) => {
                let (opcode, data) = match result {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(agent_id = %agent.id, error = %e, "agent read ended");
                        break;
                    }
                };

                agent.touch();

                match opcode {
                    Opcode::Close => break,
                    Opcode::Ping => {
                        if agent.write_frame(Opcode::Pong, &data).await.is_err() {
                            break;
                        }
                    }
                    Opcode::Binary => {
                        // Resolve the viewer under the read lock, write after
                        // releasing it. The frame is relayed byte-for-byte,
                        // channel tag included.
                        if let Some(viewer) = state.registry.viewer_for(&agent.id).await {
                            if let Err(e) = viewer.write_frame(Opcode::Binary, &data).await {
                                debug!(agent_id = %agent.id, error = %e, "viewer relay write failed");
                            }
                        }
                    }
                    Opcode::Text => handle_agent_text(&state, &agent, &data).await,
                    Opcode::Continuation | Opcode::Pong => {}
                }
            }
            _ = closed.changed() => {}
        }
    }

    cleanup(&state, &agent).await;
}

async fn handle_agent_text(state: &AppState, agent: &LiveAgent, data: &[u8]) {
    match serde_json::from_slice::<Envelope>(data) {
        Ok(Envelope::Heartbeat) => {
            // last_seen was already refreshed by the read loop; the
            // heartbeat exists so idle agents keep refreshing it.
        }
        Ok(Envelope::DisplaySwitched(_)) => {
            if let Some(viewer) = state.registry.viewer_for(&agent.id).await {
                if let Err(e) = viewer.write_frame(Opcode::Text, data).await {
                    debug!(agent_id = %agent.id, error = %e, "display_switched relay failed");
                }
            }
        }
        Ok(other) => debug!(agent_id = %agent.id, message = ?other, "ignoring agent message"),
        Err(e) => debug!(agent_id = %agent.id, error = %e, "unparseable agent message"),
    }
}

async fn cleanup(state: &AppState, agent: &LiveAgent) {
    if state.registry.remove_agent_if(&agent.id, agent.session).await {
        if let Err(e) = state.store.update_agent_seen(&agent.id, now_utc()).await {
            debug!(agent_id = %agent.id, error = %e, "failed to persist last_seen");
        }
        info!(agent_id = %agent.id, "agent disconnected");
    }
}
