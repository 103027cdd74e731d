use axum::extract::State;
use axum::{http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
}

pub async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

/// Probes the database pool and confirms the embedder has finished (or can
/// start) its warm-up, so a load balancer does not route traffic to an
/// instance that would immediately fail every request.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    if sqlx::query("SELECT 1").execute(state.db_pool.get()).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    if state.embedder.ensure_loaded().await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    StatusCode::OK
}
