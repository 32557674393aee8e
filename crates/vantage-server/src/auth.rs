//! API-key authentication middleware for HTTP routes.
//!
//! The key arrives as `Authorization: Bearer <key>` or, because browser
//! WebSocket clients cannot set headers, as the `token` query parameter.
//! Rejections are deliberately terse; the middleware does not hand the
//! identified key to downstream handlers.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use vantage_crypto::hash_api_key;

use crate::server::api::json_error;
use crate::server::AppState;

/// Require a valid API key on the wrapped routes.
pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(key) = extract_key(&req).filter(|k| !k.is_empty()) else {
        return json_error(StatusCode::UNAUTHORIZED, "authentication required");
    };

    match state.store.verify_api_key(&hash_api_key(&key)).await {
        Ok(Some(_)) => next.run(req).await,
        _ => json_error(StatusCode::UNAUTHORIZED, "invalid API key"),
    }
}

fn extract_key(req: &Request) -> Option<String> {
    if let Some(auth) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(key) = auth.strip_prefix("Bearer ") {
            return Some(key.to_string());
        }
    }
    query_param(req.uri().query().unwrap_or(""), "token")
}

/// Pull a single value out of a raw query string. Keys and tokens are
/// plain ASCII, so no percent-decoding is needed.
pub(crate) fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}
