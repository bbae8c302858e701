//! Management HTTP plane
//!
//! Runs on data-port + 1000 and exposes the capacity governor:
//! - `GET /health` — liveness
//! - `GET /stats` — connection counts plus a runtime snapshot
//! - `GET /system` — detailed runtime snapshot
//! - `GET /limit` / `PUT /limit` — read or replace the connection limit
//! - `POST /limit/increase` / `POST /limit/decrease` — delta updates

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::defaults::SIGNAL_LIMIT_DELTA;

use super::governor::Governor;

struct ManagementState {
    governor: Arc<Governor>,
    started_at: Instant,
}

/// Bind the management listener; the server spawns `serve` on it
pub async fn bind(port: u16) -> anyhow::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

/// Serve the management plane until the shutdown signal fires
pub async fn serve(
    listener: TcpListener,
    governor: Arc<Governor>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let state = Arc::new(ManagementState {
        governor,
        started_at: Instant::now(),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/system", get(system))
        .route("/limit", get(get_limit).put(put_limit))
        .route("/limit/increase", post(increase_limit))
        .route("/limit/decrease", post(decrease_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "healthy", "service": "ferrodb"}))
}

async fn stats(State(state): State<Arc<ManagementState>>) -> impl IntoResponse {
    Json(json!({
        "connections": state.governor.stats(),
        "system": system_snapshot(&state),
    }))
}

async fn system(State(state): State<Arc<ManagementState>>) -> impl IntoResponse {
    Json(system_snapshot(&state))
}

fn system_snapshot(state: &ManagementState) -> serde_json::Value {
    json!({
        "pid": std::process::id(),
        "num_cpu": std::thread::available_parallelism().map(|p| p.get()).unwrap_or(1),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "timestamp": chrono::Utc::now(),
    })
}

async fn get_limit(State(state): State<Arc<ManagementState>>) -> impl IntoResponse {
    Json(json!({
        "current_limit": state.governor.current_limit(),
        "active_connections": state.governor.active(),
    }))
}

#[derive(Deserialize)]
struct PutLimitRequest {
    limit: usize,
}

async fn put_limit(
    State(state): State<Arc<ManagementState>>,
    Json(request): Json<PutLimitRequest>,
) -> impl IntoResponse {
    match state.governor.request_update(request.limit) {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "new_limit": request.limit,
                "message": format!("Connection limit updated to {}", request.limit),
            })),
        ),
        Err(e) => rejection(e.to_string(), &state),
    }
}

#[derive(Deserialize)]
struct DeltaRequest {
    amount: Option<usize>,
}

async fn increase_limit(
    State(state): State<Arc<ManagementState>>,
    request: Option<Json<DeltaRequest>>,
) -> impl IntoResponse {
    let amount = request
        .and_then(|Json(r)| r.amount)
        .unwrap_or(SIGNAL_LIMIT_DELTA);
    let old_limit = state.governor.current_limit();
    let new_limit = old_limit.saturating_add(amount);

    match state.governor.request_update(new_limit) {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "old_limit": old_limit,
                "new_limit": new_limit,
                "increase_amount": amount,
            })),
        ),
        Err(e) => rejection(e.to_string(), &state),
    }
}

async fn decrease_limit(
    State(state): State<Arc<ManagementState>>,
    request: Option<Json<DeltaRequest>>,
) -> impl IntoResponse {
    let amount = request
        .and_then(|Json(r)| r.amount)
        .unwrap_or(SIGNAL_LIMIT_DELTA);
    let old_limit = state.governor.current_limit();
    let new_limit = old_limit.saturating_sub(amount);

    match state.governor.request_update(new_limit) {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "old_limit": old_limit,
                "new_limit": new_limit,
                "decrease_amount": amount,
            })),
        ),
        Err(e) => rejection(e.to_string(), &state),
    }
}

/// The rejection shape echoes current and active counts so a refused
/// decrease is self-explanatory
fn rejection(
    error: String,
    state: &ManagementState,
) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "status": "failed",
            "error": error,
            "current_limit": state.governor.current_limit(),
            "active_connections": state.governor.active(),
        })),
    )
}
