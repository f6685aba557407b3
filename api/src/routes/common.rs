use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Serialize;
use services::error::AppError;
use services::models::{AttendanceSession, DisplayMeta, SecurityFeatures};
use services::validation::ScanRejection;

/// Session as shown to lecturers and scanners. The raw key is not exposed;
/// `encoded_token` is what gets rendered as a code.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub id: String,
    pub course_code: String,
    pub course_name: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub display: DisplayMeta,
    pub security: SecurityFeatures,
    pub encoded_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<AttendanceSession> for SessionResponse {
    fn from(s: AttendanceSession) -> Self {
        Self {
            id: s.id,
            course_code: s.course_code,
            course_name: s.course_name,
            starts_at: s.starts_at,
            ends_at: s.ends_at,
            duration_minutes: s.duration_minutes,
            display: s.display,
            security: s.security,
            encoded_token: s.encoded_token,
            created_at: s.created_at,
        }
    }
}

pub fn rejection_status(reason: &ScanRejection) -> StatusCode {
    match reason {
        ScanRejection::StaleToken => StatusCode::CONFLICT,
        ScanRejection::UnknownSession => StatusCode::NOT_FOUND,
        ScanRejection::ExpiredSession => StatusCode::GONE,
        ScanRejection::InvalidPayload(_) => StatusCode::BAD_REQUEST,
        ScanRejection::DeviceMismatch | ScanRejection::IpNotPermitted => StatusCode::FORBIDDEN,
    }
}

/// HTTP status and message for a service error.
pub fn error_response(e: &AppError) -> (StatusCode, String) {
    match e {
        AppError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        AppError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        AppError::Rejected(reason) => (rejection_status(reason), reason.user_message().to_string()),
        AppError::NotAuthenticated => (StatusCode::UNAUTHORIZED, e.to_string()),
        _ => {
            tracing::error!(error = %e, "request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
        }
    }
}
