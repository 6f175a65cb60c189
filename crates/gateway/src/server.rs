//! Minimal HTTP/WS server wiring: a health check, the WS ingress endpoint
//! (C8), and the ambient middleware stack (panic catching, request
//! tracing). Auth, CORS, and every other admin/API surface the teacher
//! carries are out of scope for this core — an embedding application owns
//! those. What's here is just enough to run the proxy.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::{IntoResponse, Json},
    routing::get,
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, info};

use crate::ingress::{self, GatewayCore};

const UPSTREAM_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const UPSTREAM_IDLE_TTL: Duration = Duration::from_secs(relay_protocol::DEFAULT_TRANSPORT_IDLE_TTL_SECS);

/// Builds the router: `GET /health` plus the WS ingress endpoint, wrapped in
/// panic-catching and request tracing, matching the teacher's
/// `apply_middleware_stack` ordering (innermost first, panic catch outermost
/// so even a panic inside tracing's own span setup is caught).
#[must_use]
pub fn build_router(core: Arc<GatewayCore>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws/responses", get(ws_upgrade_handler))
        .layer(
            TraceLayer::new_for_http()
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CatchPanicLayer::new())
        .with_state(core)
}

async fn health_handler(State(core): State<Arc<GatewayCore>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "ws_enabled": core.config.enabled,
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(core): State<Arc<GatewayCore>>,
) -> impl IntoResponse {
    info!(remote = %addr, "ws ingress: upgrade accepted");
    ws.on_upgrade(move |socket| ingress::handle_connection(socket, core, None))
}

/// Binds `addr` and serves `core` until the process is killed. Spawns a
/// background tick that sweeps idle pooled transports and parked upstream
/// connections so neither grows unbounded across long-lived processes.
pub async fn run(core: Arc<GatewayCore>, addr: SocketAddr) -> anyhow::Result<()> {
    let sweep_core = Arc::clone(&core);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(UPSTREAM_SWEEP_INTERVAL);
        loop {
            tick.tick().await;
            sweep_core.dialer.sweep_idle();
            sweep_core.upstreams.sweep_idle(UPSTREAM_IDLE_TTL);
        }
    });

    let app = build_router(core);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "relay-gateway: listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
