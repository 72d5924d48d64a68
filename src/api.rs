//! Localhost status API.
//!
//! A small axum surface for dashboards: status reads plus two worker
//! control endpoints. POSTs are accepted only from loopback unless the
//! host explicitly opts into remote control — the engine itself never
//! serves remote clients.

use crate::config::Tuneables;
use crate::engine::AdvisoryEngine;
use crate::home::SparkHome;
use crate::prefetch::PrefetchWorker;
use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub addr: SocketAddr,
    /// Allow POSTs from non-loopback peers.
    pub allow_remote_write: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { addr: ([127, 0, 0, 1], 8787).into(), allow_remote_write: false }
    }
}

#[derive(Clone)]
struct AppState {
    home: SparkHome,
    allow_remote_write: bool,
}

/// Build the status router.
fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/status/store", get(store_status_handler))
        .route("/status/worker", get(worker_status_handler))
        .route("/prefetch/pause", post(pause_handler))
        .route("/prefetch/resume", post(resume_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Serve until the process exits.
pub async fn serve(home: SparkHome, config: ApiConfig) -> crate::error::Result<()> {
    let state = AppState { home, allow_remote_write: config.allow_remote_write };
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    info!(addr = %config.addr, "advisory status API listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine = AdvisoryEngine::new(state.home.clone());
    Json(engine.status())
}

async fn store_status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine = AdvisoryEngine::new(state.home.clone());
    Json(serde_json::to_value(engine.packet_store().status()).unwrap_or_default())
}

async fn worker_status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tuneables = Tuneables::load(&state.home);
    let engine = AdvisoryEngine::new(state.home.clone());
    let worker = PrefetchWorker::new(&state.home, tuneables.prefetch);
    Json(worker.status(engine.packet_store()))
}

#[derive(Debug, Default, Deserialize)]
struct PauseRequest {
    #[serde(default)]
    reason: String,
}

fn write_allowed(state: &AppState, addr: &SocketAddr) -> bool {
    state.allow_remote_write || addr.ip().is_loopback()
}

async fn pause_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Option<Json<PauseRequest>>,
) -> impl IntoResponse {
    if !write_allowed(&state, &addr) {
        return (StatusCode::FORBIDDEN, Json(serde_json::json!({"error": "loopback only"})));
    }
    let tuneables = Tuneables::load(&state.home);
    let worker = PrefetchWorker::new(&state.home, tuneables.prefetch);
    let reason = body.map(|Json(b)| b.reason).unwrap_or_default();
    worker.set_paused(true, &reason);
    (StatusCode::OK, Json(serde_json::json!({"paused": true})))
}

async fn resume_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    if !write_allowed(&state, &addr) {
        return (StatusCode::FORBIDDEN, Json(serde_json::json!({"error": "loopback only"})));
    }
    let tuneables = Tuneables::load(&state.home);
    let worker = PrefetchWorker::new(&state.home, tuneables.prefetch);
    worker.set_paused(false, "");
    (StatusCode::OK, Json(serde_json::json!({"paused": false})))
}
