//! # Valuation Handlers
//!
//! The submission endpoint and the status/results queries. Terminal failure
//! bodies always carry the request ID; failure detail is best-effort.

use crate::front::{ResultsOutcome, StatusView, SubmissionMode, SubmissionOutcome};
use crate::web::errors::{ApiError, ApiResult};
use crate::web::state::AppState;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct SubmitQuery {
    pub sync: Option<String>,
}

/// Submit a valuation request: POST /valuation?sync={Y|N}
pub async fn submit_valuation(
    State(state): State<AppState>,
    Query(query): Query<SubmitQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    validate_content_type(&headers)?;
    let mode = SubmissionMode::parse(query.sync.as_deref())?;

    let payload = std::str::from_utf8(&body)
        .map_err(|_| ApiError::bad_request("body is not valid UTF-8"))?;

    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let metadata = collect_metadata(&headers);

    info!(
        sync = matches!(mode, SubmissionMode::Sync),
        bytes = payload.len(),
        "Valuation submission received"
    );

    let outcome = state
        .submission
        .submit(payload, mode, metadata, idempotency_key.as_deref())
        .await?;

    Ok(render_outcome(outcome))
}

fn validate_content_type(headers: &HeaderMap) -> ApiResult<()> {
    if let Some(content_type) = headers.get(header::CONTENT_TYPE) {
        let value = content_type.to_str().unwrap_or_default();
        if !value.contains("xml") {
            return Err(ApiError::bad_request(format!(
                "content type must be application/xml or text/xml, got {value:?}"
            )));
        }
    }
    Ok(())
}

/// `X-*` headers travel with the request as its metadata mapping.
fn collect_metadata(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with("x-"))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn render_outcome(outcome: SubmissionOutcome) -> Response {
    match outcome {
        SubmissionOutcome::Accepted { request_id } => (
            StatusCode::ACCEPTED,
            Json(json!({"requestId": request_id, "status": "accepted"})),
        )
            .into_response(),
        SubmissionOutcome::Pending { request_id } => (
            StatusCode::ACCEPTED,
            Json(json!({"requestId": request_id, "status": "pending"})),
        )
            .into_response(),
        SubmissionOutcome::Completed {
            request_id: _,
            response_xml,
        } => xml_response(StatusCode::OK, response_xml),
        SubmissionOutcome::Failed { request_id, detail } => failure_response(&request_id, detail),
    }
}

fn failure_response(request_id: &str, detail: Option<String>) -> Response {
    match detail {
        Some(detail) => {
            let detail_value = serde_json::from_str::<serde_json::Value>(&detail)
                .unwrap_or(serde_json::Value::String(detail));
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({
                    "requestId": request_id,
                    "status": "failed",
                    "detail": detail_value,
                })),
            )
                .into_response()
        }
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"requestId": request_id, "status": "failed"})),
        )
            .into_response(),
    }
}

fn xml_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/xml")],
        body,
    )
        .into_response()
}

/// Request status: GET /valuation/{request_id}/status
pub async fn valuation_status(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> ApiResult<Json<StatusView>> {
    let view = state.submission.status(&request_id).await?;
    Ok(Json(view))
}

/// Request results: GET /valuation/{request_id}/results
pub async fn valuation_results(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> ApiResult<Response> {
    match state.submission.results(&request_id).await? {
        ResultsOutcome::Ready(response_xml) => Ok(xml_response(StatusCode::OK, response_xml)),
        ResultsOutcome::Failed { detail } => Ok(failure_response(&request_id, detail)),
    }
}
