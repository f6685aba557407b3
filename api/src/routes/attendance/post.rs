use crate::response::ApiResponse;
use crate::routes::common::rejection_status;
use crate::state::AppState;
use axum::{
    Json,
    extract::{ConnectInfo, State},
    http::StatusCode,
};
use services::validation::{ValidationOutcome, ValidationRequest, ValidationResponse};
use std::net::SocketAddr;

/// POST /api/attendance/validate
///
/// Judges one scan claim. Live claims are checked against the session's
/// current key; offline replays against the key current at their capture
/// time. The client address is taken from the connection, never the body.
///
/// ### Responses
/// - `200 OK` accepted, or already recorded (`error_code: "AlreadyScanned"`)
/// - `400` invalid payload, `403` device/IP restriction, `404` unknown session,
///   `409` stale key, `410` session expired; `data` carries the rejection
/// - `500 Internal Server Error` with `data: null`, which callers treat as transient
pub async fn validate_claim(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(mut body): Json<ValidationRequest>,
) -> (StatusCode, Json<ApiResponse<Option<ValidationResponse>>>) {
    body.client_ip = Some(addr.ip());

    match state.validator().check(&body).await {
        Ok(response) => {
            let message = response.message.clone();
            match response.outcome() {
                ValidationOutcome::Accepted | ValidationOutcome::AlreadyScanned => (
                    StatusCode::OK,
                    Json(ApiResponse::success(Some(response), message)),
                ),
                ValidationOutcome::Rejected(reason) => (
                    rejection_status(&reason),
                    Json(ApiResponse::failure(Some(response), reason.user_message())),
                ),
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "claim validation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error("Validation failed")),
            )
        }
    }
}
