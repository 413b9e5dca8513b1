//! Control surface: HTTP API plus the WebSocket push channel.
//!
//! Route isolation: `/ws` lives in a minimal group carrying only the
//! request-id layer, registered before anything that wraps responses —
//! middleware that touches the response body breaks the protocol upgrade.
//! Every other route sits inside the full middleware stack (request-id,
//! structured tracing, panic recovery, per-request timeout, CORS).

pub mod api;
pub mod problem;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{Paths, Settings};
use crate::hub::PushHub;
use crate::license::LicenseManager;
use crate::pipeline::PipelineManager;

/// Per-request handler deadline for plain API routes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the handlers need.
pub struct AppState {
    pub manager: Arc<PipelineManager>,
    pub hub: Arc<PushHub>,
    pub license: Arc<LicenseManager>,
    pub paths: Arc<Paths>,
    pub settings: Arc<Settings>,
}

pub type SharedState = Arc<AppState>;

/// Assemble the two route groups.
pub fn build_router(state: SharedState) -> Router {
    // Upgrade-safe group: request-id only, nothing that wraps the response.
    let upgrade_safe = Router::new()
        .route("/ws", get(ws::ws_handler))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    // Full group for everything else. Layers run outermost-last here, so
    // the request id is assigned before tracing and propagation see it.
    let full = api::api_router()
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(CorsLayer::permissive())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    upgrade_safe.merge(full).with_state(state)
}

/// Serve until the cancellation token fires, then notify observers and
/// close cleanly.
pub async fn serve(state: SharedState, cancel: CancellationToken) -> Result<()> {
    let addr: SocketAddr = ([127, 0, 0, 1], state.settings.port).into();
    let hub = state.hub.clone();
    let app = build_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind control surface on {addr}"))?;
    info!(%addr, "control surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let cancel = cancel.clone();
            async move {
                cancel.cancelled().await;
            }
        })
        .await
        .context("control surface server error")?;

    hub.shutdown("server shutting down");
    Ok(())
}
