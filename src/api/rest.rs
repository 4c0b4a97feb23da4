// =============================================================================
// REST API Endpoints — Axum
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; everything else
// requires a valid Bearer token via the `AuthBearer` extractor. CORS is
// permissive for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::news::store::StoryClusterStore;
use crate::resilience::snapshot::SnapshotType;
use crate::types::EngineMode;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/status", get(status))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/pending-orders", get(pending_orders))
        .route("/api/v1/trades", get(trades))
        .route("/api/v1/clusters/hot", get(hot_clusters))
        .route("/api/v1/breakers", get(breakers))
        .route("/api/v1/agent-status", get(agent_status))
        .route("/api/v1/snapshot", post(take_snapshot))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/emergency-stop", post(control_emergency_stop))
        .route(
            "/api/v1/control/reset-emergency-stop",
            post(control_reset_emergency_stop),
        )
        // ── WebSocket ───────────────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    overall: crate::resilience::circuit::OverallHealth,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let summary = state.breakers.health_summary();
    Json(HealthResponse {
        status: "ok",
        overall: summary.overall,
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Read endpoints (authenticated)
// =============================================================================

async fn status(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_status_snapshot().await)
}

async fn positions(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.positions())
}

async fn pending_orders(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.engine.pending_orders())
}

async fn trades(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.trades())
}

async fn hot_clusters(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.cluster_store.hottest_clusters(20).await {
        Ok(clusters) => Json(clusters).into_response(),
        Err(e) => {
            warn!(error = %e, "hot cluster query failed");
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn breakers(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.breakers.health_summary())
}

async fn agent_status(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.prediction.statuses())
}

// =============================================================================
// Control endpoints (authenticated)
// =============================================================================

async fn take_snapshot(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let snapshot = state
        .snapshots
        .create_snapshot(SnapshotType::Manual, None, None);
    info!(id = %snapshot.metadata.id, "manual snapshot requested");
    Json(serde_json::json!({
        "id": snapshot.metadata.id,
        "timestamp": snapshot.metadata.timestamp,
        "orders": snapshot.orders.len(),
        "positions": snapshot.positions.len(),
    }))
}

async fn control_pause(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    state.runtime_config.write().engine_mode = EngineMode::Paused;
    state.increment_version();
    info!("engine paused via API");
    Json(serde_json::json!({ "engine_mode": "Paused" }))
}

async fn control_resume(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    state.runtime_config.write().engine_mode = EngineMode::Running;
    state.increment_version();
    info!("engine resumed via API");
    Json(serde_json::json!({ "engine_mode": "Running" }))
}

async fn control_emergency_stop(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    state.risk.trigger_emergency_stop("api request");
    state.bus.publish(
        crate::bus::Channel::EmergencyStop,
        serde_json::json!({ "source": "api" }),
    );
    state.increment_version();
    Json(serde_json::json!({ "emergency_stop": true }))
}

async fn control_reset_emergency_stop(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    state.risk.reset_emergency_stop();
    state.increment_version();
    Json(serde_json::json!({ "emergency_stop": false }))
}
