use super::common::{CreateSessionReq, ManualSignInReq, RotateResponse, SignInResponse};
use crate::response::ApiResponse;
use crate::routes::common::{SessionResponse, error_response};
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use ::common::format_validation_errors;
use validator::Validate;

/// POST /api/sessions
///
/// Starts a session for a course, effective immediately. A course already
/// holding a live session is refused with `400`.
///
/// ### Request Body
/// ```json
/// {
///   "course_code": "COS301",
///   "course_name": "Software Engineering",
///   "duration_minutes": 60,
///   "venue": "IT 4-1",
///   "restrict_by_ip": true,
///   "allowed_ip_cidr": "10.0.0.0/8",
///   "course_rep": "21/0001"
/// }
/// ```
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionReq>,
) -> (StatusCode, Json<ApiResponse<Option<SessionResponse>>>) {
    if let Err(validation_errors) = req.validate() {
        let error_message = format_validation_errors(&validation_errors);
        return (StatusCode::BAD_REQUEST, Json(ApiResponse::error(error_message)));
    }

    match state.admin().start_session(req.into()).await {
        Ok(session) => (
            StatusCode::CREATED,
            Json(ApiResponse::success(
                Some(session.into()),
                "Attendance session started",
            )),
        ),
        Err(e) => {
            let (status, message) = error_response(&e);
            (status, Json(ApiResponse::error(message)))
        }
    }
}

/// POST /api/sessions/{session_id}/rotate
///
/// Issues a new temporal key. Codes rendered from any earlier key stop
/// admitting live scans immediately.
pub async fn rotate_key(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> (StatusCode, Json<ApiResponse<RotateResponse>>) {
    if let Err(e) = state.rotator().rotate(&session_id).await {
        let (status, message) = error_response(&e);
        return (status, Json(ApiResponse::error(message)));
    }

    let encoded_token = state
        .store()
        .get_session(&session_id)
        .await
        .and_then(|s| s.encoded_token);
    (
        StatusCode::OK,
        Json(ApiResponse::success(
            RotateResponse {
                session_id,
                encoded_token,
                rotated_at: Some(state.clock().now()),
            },
            "Temporal key rotated",
        )),
    )
}

/// POST /api/sessions/{session_id}/end
pub async fn end_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> (StatusCode, Json<ApiResponse<Option<SessionResponse>>>) {
    match state.admin().end_session(&session_id).await {
        Ok(session) => (
            StatusCode::OK,
            Json(ApiResponse::success(
                Some(session.into()),
                "Attendance session ended",
            )),
        ),
        Err(e) => {
            let (status, message) = error_response(&e);
            (status, Json(ApiResponse::error(message)))
        }
    }
}

/// POST /api/sessions/{session_id}/sign-in
///
/// Marks a student present by hand, e.g. when their device cannot scan.
pub async fn manual_sign_in(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<ManualSignInReq>,
) -> (StatusCode, Json<ApiResponse<SignInResponse>>) {
    if let Err(validation_errors) = req.validate() {
        let error_message = format_validation_errors(&validation_errors);
        return (StatusCode::BAD_REQUEST, Json(ApiResponse::error(error_message)));
    }

    match state.admin().manual_sign_in(&session_id, &req.student_id).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(ApiResponse::success(
                SignInResponse {
                    session_id,
                    student_id: req.student_id,
                    already_signed_in: outcome.was_already_scanned(),
                },
                "Student signed in",
            )),
        ),
        Err(e) => {
            let (status, message) = error_response(&e);
            (status, Json(ApiResponse::error(message)))
        }
    }
}
