//! RFC 6455 upgrade handshake on top of hyper.
//!
//! Validates the upgrade headers, computes the accept key, and hands back
//! the `OnUpgrade` future plus the `101 Switching Protocols` response.
//! Once hyper has written the response, the future resolves to the raw
//! byte stream and ownership transfers to the session handler.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, Response, StatusCode};
use hyper::upgrade::OnUpgrade;
use vantage_proto::accept_key;

use super::api::json_error;

pub struct WsUpgrade {
    pub on_upgrade: OnUpgrade,
    pub response: Response<Body>,
}

/// Validate a WebSocket upgrade request. On failure the returned response
/// is a 400 and no upgrade happens.
pub fn upgrade_websocket(req: &mut Request) -> Result<WsUpgrade, Response<Body>> {
    let is_websocket = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !is_websocket {
        return Err(json_error(StatusCode::BAD_REQUEST, "not a websocket request"));
    }

    let Some(key) = req
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
    else {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "missing Sec-WebSocket-Key",
        ));
    };

    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        return Err(json_error(StatusCode::BAD_REQUEST, "upgrade failed"));
    };

    let response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key(&key))
        .body(Body::empty())
        .unwrap_or_else(|_| {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "upgrade failed")
        });

    Ok(WsUpgrade {
        on_upgrade,
        response,
    })
}
