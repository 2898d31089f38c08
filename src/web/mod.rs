//! # Web Surface
//!
//! Axum router for the gateway's HTTP edge.

pub mod errors;
pub mod handlers;
pub mod state;

pub use errors::{ApiError, ApiResult};
pub use state::AppState;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

pub fn build_router(state: AppState) -> Router {
    let max_payload_bytes = state.config.max_payload_bytes;
    Router::new()
        .route("/valuation", post(handlers::valuations::submit_valuation))
        .route(
            "/valuation/{request_id}/status",
            get(handlers::valuations::valuation_status),
        )
        .route(
            "/valuation/{request_id}/results",
            get(handlers::valuations::valuation_results),
        )
        .route("/healthz", get(handlers::health::healthz))
        .route("/readyz", get(handlers::health::readyz))
        .layer(DefaultBodyLimit::max(max_payload_bytes))
        .with_state(state)
}
