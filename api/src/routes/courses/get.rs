use crate::response::ApiResponse;
use crate::routes::common::SessionResponse;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

/// GET /api/courses/{course_code}/sessions/active
///
/// The course's live session, if one is held and has not ended.
///
/// ### Responses
/// - `200 OK` with the session
/// - `404 Not Found` when the course has no live session
pub async fn get_active_session(
    State(state): State<AppState>,
    Path(course_code): Path<String>,
) -> (StatusCode, Json<ApiResponse<Option<SessionResponse>>>) {
    if !state.store().has_active_session(&course_code).await {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!(
                "No active session for {course_code}"
            ))),
        );
    }

    match state.store().get_current_session(&course_code).await {
        Some(session) => (
            StatusCode::OK,
            Json(ApiResponse::success(
                Some(session.into()),
                "Active session retrieved",
            )),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!(
                "No active session for {course_code}"
            ))),
        ),
    }
}
