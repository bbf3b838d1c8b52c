//! API route definitions.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{routing::get, routing::post, Json, Router};
use serde_json::{json, Value};

use super::state::AppState;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/run", post(trigger_run))
}

/// Handler for `GET /health`. Flat shape for monitoring probes.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Handler for `GET /api/v1/status`: the run ledger plus the derived
/// breaker state. Durations are reported in seconds.
async fn status(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.scheduler.snapshot().await;
    let breaker_open = snapshot.breaker_open(state.scheduler.failure_threshold());

    Json(json!({
        "data": {
            "is_running": snapshot.is_running,
            "last_run": snapshot.last_run,
            "next_run": snapshot.next_run,
            "last_success": snapshot.last_success,
            "last_error": snapshot.last_error,
            "last_run_duration_seconds": snapshot
                .last_run_duration_ms
                .map(|ms| ms as f64 / 1000.0),
            "consecutive_failures": snapshot.consecutive_failures,
            "breaker_open": breaker_open,
            "total_runs": snapshot.total_runs,
            "total_successes": snapshot.total_successes,
            "total_failures": snapshot.total_failures,
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

/// Handler for `POST /api/v1/run`: start a manual crawl in the background.
///
/// Answers `202 Accepted` with the run id once the run is admitted, or
/// `409 Conflict` when a run is already in flight. Manual triggers bypass
/// an open circuit breaker.
async fn trigger_run(State(state): State<AppState>) -> impl IntoResponse {
    match state.scheduler.clone().spawn_manual().await {
        Ok(run_id) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "data": { "started": true, "run_id": run_id }
            })),
        ),
        Err(refused) => (
            StatusCode::CONFLICT,
            Json(json!({
                "data": { "started": false },
                "error": refused.to_string()
            })),
        ),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
