// =============================================================================
// REST Control Plane — Axum 0.7
// =============================================================================
//
// The minimal operational surface: health, a full state snapshot, positions,
// opportunities, relationships, alerts, kill-switch engage/disengage, and
// force-flat.  Every control action is one call into the governor or state.
//
// CORS is configured permissively for development; tighten allowed origins
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::alerts::AlertLevel;
use crate::app_state::AppState;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/opportunities", get(opportunities))
        .route("/api/v1/relationships", get(relationships))
        .route("/api/v1/alerts", get(alerts))
        .route("/api/v1/control/kill", post(control_kill))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/force-flat", post(control_force_flat))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Read endpoints
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "state_version": state.current_state_version(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

async fn full_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn positions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.governor.positions())
}

async fn opportunities(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.recent_opportunities_list())
}

async fn relationships(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.catalog.snapshot())
}

async fn alerts(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.alerts.list())
}

// =============================================================================
// Control endpoints
// =============================================================================

async fn control_kill(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.governor.engage_kill_switch("operator request");
    state
        .alerts
        .push(AlertLevel::Critical, "kill switch engaged by operator");
    state.increment_version();
    Json(serde_json::json!({ "kill_switch": true }))
}

async fn control_resume(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.governor.disengage_kill_switch();
    state
        .alerts
        .push(AlertLevel::Info, "kill switch disengaged by operator");
    state.increment_version();
    Json(serde_json::json!({ "kill_switch": false }))
}

#[derive(Deserialize)]
struct ForceFlatRequest {
    ticker: String,
}

async fn control_force_flat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ForceFlatRequest>,
) -> impl IntoResponse {
    match state.governor.position(&request.ticker) {
        Some(pos) if pos.net_contracts != 0 => {
            info!(ticker = %request.ticker, net = pos.net_contracts, "force-flat queued");
            state.request_flatten(&request.ticker);
            Json(serde_json::json!({
                "queued": true,
                "ticker": request.ticker,
                "net_contracts": pos.net_contracts,
            }))
            .into_response()
        }
        _ => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "queued": false,
                "error": "no open position for ticker",
            })),
        )
            .into_response(),
    }
}
