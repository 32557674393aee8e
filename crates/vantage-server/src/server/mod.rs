//! HTTP server assembly: router, shared state, and the accept loop.

pub mod agent_ws;
pub mod api;
pub mod upgrade;
pub mod viewer_ws;

#[cfg(test)]
mod session_tests;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::{middleware, Extension, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::debug;
use vantage_crypto::Platform;

use crate::registry::Registry;
use crate::storage::Store;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub platform: Arc<Platform>,
    pub registry: Arc<Registry>,
    /// PEM path of the self-signed CA, handed to agents at enrollment.
    pub ca_cert_path: Option<PathBuf>,
}

/// Remote peer address, attached per connection by the accept loop.
#[derive(Debug, Clone, Copy)]
pub struct PeerAddr(pub SocketAddr);

/// Assemble the HTTP routes. Enrollment, auth verification, and the two
/// WebSocket endpoints are public; the management API requires an API key.
pub fn build_router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/api/agents", get(api::list_agents))
        .route(
            "/api/enrollment",
            get(api::list_enrollment_tokens)
                .post(api::create_enrollment_token)
                .delete(api::delete_enrollment_token),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_api_key,
        ));

    Router::new()
        .route("/api/enroll", post(api::enroll))
        .route("/api/auth/verify", post(api::auth_verify))
        .route("/ws/agent", get(agent_ws::handle_agent))
        .route("/ws/viewer", get(viewer_ws::handle_viewer))
        .merge(authed)
        .with_state(state)
}

/// Accept loop: each connection is optionally TLS-terminated, then served
/// by hyper with upgrade support so the WebSocket handlers can take over
/// the raw stream.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    acceptor: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let svc = router.clone().layer(Extension(PeerAddr(peer)));

        match acceptor.clone() {
            Some(acceptor) => {
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls) => serve_connection(tls, svc).await,
                        Err(e) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                    }
                });
            }
            None => {
                tokio::spawn(serve_connection(stream, svc));
            }
        }
    }
}

async fn serve_connection<S>(stream: S, svc: Router)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = TowerToHyperService::new(svc);
    if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
    {
        debug!(error = %e, "connection closed with error");
    }
}
