//! # Health Handlers

use crate::web::errors::ApiError;
use crate::web::state::AppState;
use axum::extract::State;
use axum::Json;
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
}

/// Liveness: GET /healthz. Always available while the process runs.
pub async fn healthz(_state: State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness: GET /readyz. Verifies datastore connectivity.
pub async fn readyz(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let healthy = state
        .store
        .health_check()
        .await
        .map_err(|_| ApiError::ServiceUnavailable)?;
    if !healthy {
        return Err(ApiError::ServiceUnavailable);
    }
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
    }))
}
