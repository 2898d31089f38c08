//! # Web API Error Types
//!
//! HTTP-facing error surface with status-code conversions. Leverages
//! thiserror for structure and Axum's `IntoResponse` for rendering.

use crate::error::ValuationError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Resource not found")]
    NotFound,

    #[error("Resource expired")]
    Gone,

    #[error("Invalid request: {message}")]
    BadRequest { message: String },

    #[error("Payload too large")]
    PayloadTooLarge,

    #[error("Idempotency key conflict: {message}")]
    Conflict { message: String },

    #[error("Service temporarily unavailable")]
    ServiceUnavailable,

    #[error("Request timeout")]
    Timeout,

    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_code, message) = match &self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", "Resource not found"),

            ApiError::Gone => (StatusCode::GONE, "GONE", "Resource expired"),

            ApiError::BadRequest { message } => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", message.as_str())
            }

            ApiError::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                "Payload too large",
            ),

            ApiError::Conflict { message } => {
                (StatusCode::CONFLICT, "IDEMPOTENCY_CONFLICT", message.as_str())
            }

            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                "Service temporarily unavailable",
            ),

            ApiError::Timeout => (StatusCode::REQUEST_TIMEOUT, "TIMEOUT", "Request timeout"),

            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error",
            ),
        };

        let error_response = json!({
            "error": {
                "code": error_code,
                "message": message
            }
        });

        (status_code, Json(error_response)).into_response()
    }
}

impl From<ValuationError> for ApiError {
    fn from(error: ValuationError) -> Self {
        match error {
            ValuationError::InvalidInput(message) => ApiError::BadRequest { message },
            ValuationError::PayloadTooLarge { .. } => ApiError::PayloadTooLarge,
            ValuationError::NotFound(_) => ApiError::NotFound,
            ValuationError::Gone(_) => ApiError::Gone,
            // The results contract reports an in-flight request as absent.
            ValuationError::NotReady(_) => ApiError::NotFound,
            ValuationError::IdempotencyConflict(message) => ApiError::Conflict { message },
            ValuationError::DatastoreUnavailable(_) => ApiError::ServiceUnavailable,
            ValuationError::Timeout(_) => ApiError::Timeout,
            _ => ApiError::Internal,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
