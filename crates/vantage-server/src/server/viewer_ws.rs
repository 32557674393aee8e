//! Viewer WebSocket session lifecycle.
//!
//! A viewer authenticates with an API key (query parameter; browsers
//! cannot set headers on WebSocket requests), binds to one live agent,
//! and is bracketed by `start_capture`/`stop_capture` control messages to
//! that agent. Text envelopes of type `input` and `switch_display` are
//! forwarded to the agent verbatim; everything else is dropped.

use std::collections::HashMap;

use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, info, warn};
use vantage_crypto::hash_api_key;
use vantage_proto::{read_frame, Envelope, Opcode};

use super::api::json_error;
use super::upgrade::upgrade_websocket;
use super::AppState;
use crate::registry::LiveAgent;

/// `GET /ws/viewer?agent=<id>&token=<apikey>`.
pub async fn handle_viewer(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    mut req: Request,
) -> Response {
    let token = params.get("token").map(String::as_str).unwrap_or("");
    if token.is_empty() {
        return json_error(StatusCode::UNAUTHORIZED, "authentication required");
    }
    match state.store.verify_api_key(&hash_api_key(token)).await {
        Ok(Some(_)) => {}
        _ => return json_error(StatusCode::UNAUTHORIZED, "invalid API key"),
    }

    let agent_id = params.get("agent").map(String::as_str).unwrap_or("");
    if agent_id.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "agent parameter required");
    }

    let Some(agent) = state.registry.get_agent(agent_id).await else {
        return json_error(StatusCode::NOT_FOUND, "agent not found");
    };

    let ws = match upgrade_websocket(&mut req) {
        Ok(ws) => ws,
        Err(response) => {
            warn!(agent_id = %agent_id, "viewer WebSocket upgrade failed");
            return response;
        }
    };

    let agent_id = agent_id.to_string();
    tokio::spawn(async move {
        match ws.on_upgrade.await {
            Ok(upgraded) => {
                viewer_session(state, agent, agent_id, TokioIo::new(upgraded)).await;
            }
            Err(e) => warn!(error = %e, "viewer upgrade did not complete"),
        }
    });

    ws.response
}

pub(crate) async fn viewer_session<S>(
    state: AppState,
    agent: Arc<LiveAgent>,
    agent_id: String,
    stream: S,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let (viewer, displaced) = state
        .registry
        .attach_viewer(&agent_id, Box::new(write_half))
        .await;
    if let Some(old) = displaced {
        old.evict();
    }

    info!(agent_id = %agent_id, name = %agent.registration.name, "viewer connected");

    // Sent before the read loop, so the viewer's first relayed frame is
    // always preceded by start_capture on the agent side.
    if let Err(e) = agent.send_envelope(&Envelope::StartCapture).await {
        debug!(agent_id = %agent_id, error = %e, "failed to send start_capture");
    }

    let mut closed = viewer.close_signal();
    loop {
        if *closed.borrow_and_update() {
            debug!(agent_id = %agent_id, "viewer displaced by newer connection");
            break;
        }

        tokio::select! {
            result = read_frame(&mut reader) => {
                match result {
                    Ok((Opcode::Close, _)) | Err(_) => break,
                    Ok((Opcode::Text, data)) => {
                        match serde_json::from_slice::<Envelope>(&data) {
                            Ok(Envelope::Input(_)) | Ok(Envelope::SwitchDisplay(_)) => {
                                // Forward the original bytes; the broker only
                                // classifies, it never rewrites.
                                if agent.write_frame(Opcode::Text, &data).await.is_err() {
                                    break;
                                }
                            }
                            _ => {}
                        }
                    }
                    Ok(_) => {}
                }
            }
            _ = closed.changed() => {}
        }
    }

    // Only the still-registered viewer stops the capture; a displaced
    // session must not cancel its successor's stream.
    if state.registry.detach_viewer_if(&agent_id, viewer.session).await {
        if let Err(e) = agent.send_envelope(&Envelope::StopCapture).await {
            debug!(agent_id = %agent_id, error = %e, "failed to send stop_capture");
        }
        info!(agent_id = %agent_id, "viewer disconnected");
    }
}
