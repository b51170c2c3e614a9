//! HTTP/WebSocket server startup: the `/health` and `/ws` routes, optional
//! TLS termination, and the supervisor tasks (liveness sweep, graceful
//! shutdown) that run alongside the accept loop.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    response::{IntoResponse, Json},
    routing::get,
};
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use wsrelay_config::Config;

use crate::{bridge, heartbeat, registry::RoomDirectory, session::handle_connection, state::GatewayState};

#[derive(Clone)]
struct AppState {
    gateway: Arc<GatewayState>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    room: String,
    #[serde(rename = "pwd")]
    password_hash: Option<String>,
}

/// Build the router (shared between production startup and integration tests).
pub fn build_app(state: Arc<GatewayState>) -> Router {
    let app_state = AppState { gateway: state };

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Load configuration, wire up the room directory and distribution bridge,
/// and run the server until an interrupt signal is received.
pub async fn start_gateway() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let bridge = bridge::connect(config.redis_url.as_deref()).await;
    let rooms = RoomDirectory::new(Arc::clone(&bridge), config.message_cache_cap, config.disconnect_timeout);

    let heartbeat_handle = heartbeat::spawn(rooms.clone(), config.heartbeat_interval, config.pong_timeout);

    let addr: SocketAddr = format!("{}:{}", config.bind, config.port).parse()?;
    let tls = config.tls.clone();
    let rooms_for_shutdown = rooms.clone();
    let state = GatewayState::new(rooms, config);
    let app = build_app(state);

    info!(%addr, tls = tls.is_some(), "wsrelay listening");

    let result = run_server(app, addr, tls).await;

    info!("shutdown signal handled, closing all sessions");
    rooms_for_shutdown.shutdown_all();
    heartbeat_handle.abort();
    result
}

#[cfg(feature = "tls")]
async fn run_server(app: Router, addr: SocketAddr, tls: Option<wsrelay_config::TlsConfig>) -> anyhow::Result<()> {
    if let Some(tls) = tls {
        let rustls_config = load_rustls_config(&tls).await?;
        let server = axum_server::bind_rustls(addr, rustls_config);
        server
            .handle(shutdown_handle())
            .serve(app.into_make_service())
            .await?;
        return Ok(());
    }
    run_plain(app, addr).await
}

#[cfg(not(feature = "tls"))]
async fn run_server(
    app: Router,
    addr: SocketAddr,
    tls: Option<wsrelay_config::TlsConfig>,
) -> anyhow::Result<()> {
    if tls.is_some() {
        anyhow::bail!("TLS_CERT_FILE/TLS_KEY_FILE set but this build lacks the tls feature");
    }
    run_plain(app, addr).await
}

async fn run_plain(app: Router, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

#[cfg(feature = "tls")]
fn shutdown_handle() -> axum_server::Handle {
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    });
    handle
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

#[cfg(feature = "tls")]
async fn load_rustls_config(
    tls: &wsrelay_config::TlsConfig,
) -> anyhow::Result<axum_server::tls_rustls::RustlsConfig> {
    axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert_file, &tls.key_file)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load TLS material: {e}"))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": state.gateway.rooms.len(),
        "connections": state.gateway.connection_count(),
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let gateway = Arc::clone(&state.gateway);
    ws.on_upgrade(move |socket| handle_connection(socket, gateway, query.room, query.password_hash))
}
