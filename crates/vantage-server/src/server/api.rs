//! REST API handlers: enrollment, auth verification, agent listing, and
//! enrollment-token management.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use vantage_crypto::token::now_utc;
use vantage_crypto::{
    credential_hash, derive_agent_id, generate_enrollment, hash_api_key, hash_enrollment_code,
    TokenType,
};

use super::AppState;
use crate::storage::{AgentRecord, EnrollmentToken, StoreError};

/// Uniform JSON error body: `{"error": "<message>"}`.
pub(crate) fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn bad_body(rejection: &JsonRejection) -> Response {
    warn!(error = %rejection, "rejecting malformed request body");
    json_error(StatusCode::BAD_REQUEST, "invalid request body")
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct EnrollRequest {
    pub code: String,
    pub name: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
}

#[derive(Debug, Serialize)]
struct EnrollResponse {
    agent_id: String,
    credential: String,
    platform_fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ca_certificate: Option<String>,
}

/// `POST /api/enroll` — consume an enrollment code, mint a credential.
pub async fn enroll(
    State(state): State<AppState>,
    body: Result<Json<EnrollRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(&rejection),
    };

    if req.code.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "enrollment code required");
    }

    let fingerprint = state.platform.fingerprint();
    let code_hash = hash_enrollment_code(&req.code);
    let agent_id = derive_agent_id(&req.code, &fingerprint);

    let credential = state.platform.sign_credential(&agent_id);
    let now = now_utc();
    let record = AgentRecord {
        id: agent_id.clone(),
        name: req.name,
        hostname: req.hostname,
        os: req.os,
        arch: req.arch,
        credential_hash: credential_hash(&credential),
        enrolled_at: now,
        last_seen: now,
    };

    let token = match state.store.enroll_agent(&code_hash, &record).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            warn!("enrollment failed: unknown code");
            return json_error(StatusCode::FORBIDDEN, "invalid enrollment code");
        }
        Err(e @ (StoreError::TokenUsed | StoreError::TokenExpired)) => {
            warn!(error = %e, "enrollment failed");
            return json_error(StatusCode::FORBIDDEN, &e.to_string());
        }
        Err(e) => {
            error!(error = %e, "enrollment failed: store error");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "enrollment failed");
        }
    };

    info!(
        agent_id = %agent_id,
        name = %record.name,
        token_type = %token.token_type,
        "agent enrolled"
    );

    let ca_certificate = state
        .ca_cert_path
        .as_deref()
        .and_then(|path| std::fs::read_to_string(path).ok());

    Json(EnrollResponse {
        agent_id,
        credential,
        platform_fingerprint: fingerprint,
        ca_certificate,
    })
    .into_response()
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AuthVerifyRequest {
    pub key: String,
}

/// `POST /api/auth/verify` — check an API key, for dashboard login.
pub async fn auth_verify(
    State(state): State<AppState>,
    body: Result<Json<AuthVerifyRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(&rejection),
    };

    if req.key.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "key required");
    }

    match state.store.verify_api_key(&hash_api_key(&req.key)).await {
        Ok(Some(api_key)) => Json(json!({
            "valid": true,
            "name": api_key.name,
            "platform": state.platform.fingerprint(),
        }))
        .into_response(),
        _ => json_error(StatusCode::UNAUTHORIZED, "invalid API key"),
    }
}

/// `GET /api/agents` — all currently connected agents.
pub async fn list_agents(State(state): State<AppState>) -> Response {
    Json(state.registry.agent_summaries().await).into_response()
}

/// `GET /api/enrollment` — list enrollment tokens (hashes omitted).
pub async fn list_enrollment_tokens(State(state): State<AppState>) -> Response {
    match state.store.list_enrollment_tokens().await {
        Ok(tokens) => Json(tokens).into_response(),
        Err(e) => {
            error!(error = %e, "failed to list enrollment tokens");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to list tokens")
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct CreateTokenRequest {
    #[serde(rename = "type")]
    pub token_type: String,
    pub label: String,
}

#[derive(Debug, Serialize)]
struct CreateTokenResponse {
    id: String,
    code: String,
    #[serde(rename = "type")]
    token_type: String,
    label: String,
    expires_at: DateTime<Utc>,
}

/// `POST /api/enrollment` — mint a token. The formatted code appears in
/// this response and nowhere else.
pub async fn create_enrollment_token(
    State(state): State<AppState>,
    body: Result<Json<CreateTokenRequest>, JsonRejection>,
) -> Response {
    let Json(mut req) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(&rejection),
    };
    if req.token_type.is_empty() {
        req.token_type = "attended".into();
    }

    let token_type = match TokenType::parse(&req.token_type) {
        Ok(token_type) => token_type,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    let grant = generate_enrollment(token_type, &req.label);
    let token = EnrollmentToken {
        id: grant.id.clone(),
        code_hash: grant.code_hash.clone(),
        token_type: token_type.as_str().to_string(),
        label: grant.label.clone(),
        created_at: grant.created_at,
        expires_at: grant.expires_at,
        used_at: None,
        used_by: None,
    };

    if let Err(e) = state.store.create_enrollment_token(&token).await {
        error!(error = %e, "failed to create enrollment token");
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to create token");
    }

    info!(token_id = %token.id, token_type = %token.token_type, "enrollment token created");

    Json(CreateTokenResponse {
        id: token.id,
        code: grant.display_code,
        token_type: token.token_type,
        label: token.label,
        expires_at: token.expires_at,
    })
    .into_response()
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DeleteTokenParams {
    pub id: String,
}

/// `DELETE /api/enrollment?id=<token_id>`.
pub async fn delete_enrollment_token(
    State(state): State<AppState>,
    Query(params): Query<DeleteTokenParams>,
) -> Response {
    if params.id.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "id required");
    }

    match state.store.delete_enrollment_token(&params.id).await {
        Ok(()) => Json(json!({ "status": "deleted" })).into_response(),
        Err(e) => {
            error!(error = %e, "failed to delete enrollment token");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to delete")
        }
    }
}
