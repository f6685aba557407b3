use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use services::models::{DisplayMeta, SecurityFeatures};
use services::session_admin::StartSession;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSessionReq {
    #[validate(length(min = 1, max = 32, message = "course_code must be 1-32 characters"))]
    pub course_code: String,
    #[validate(length(min = 1, max = 255, message = "course_name is required"))]
    pub course_name: String,
    #[validate(range(min = 1, max = 600, message = "duration_minutes must be between 1 and 600"))]
    pub duration_minutes: i64,
    pub theme: Option<String>,
    pub venue: Option<String>,
    pub restrict_by_ip: Option<bool>,
    pub allowed_ip_cidr: Option<String>,
    pub device_binding: Option<bool>,
    pub course_rep: Option<String>,
}

impl From<CreateSessionReq> for StartSession {
    fn from(req: CreateSessionReq) -> Self {
        Self {
            course_code: req.course_code,
            course_name: req.course_name,
            duration_minutes: req.duration_minutes,
            display: DisplayMeta {
                theme: req.theme,
                venue: req.venue,
            },
            security: SecurityFeatures {
                restrict_by_ip: req.restrict_by_ip.unwrap_or(false),
                allowed_ip_cidr: req.allowed_ip_cidr,
                device_binding: req.device_binding.unwrap_or(false),
            },
            course_rep: req.course_rep,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct ManualSignInReq {
    #[validate(length(min = 1, message = "student_id is required"))]
    pub student_id: String,
}

#[derive(Debug, Default, Serialize)]
pub struct RotateResponse {
    pub session_id: String,
    pub encoded_token: Option<String>,
    pub rotated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize)]
pub struct SignInResponse {
    pub session_id: String,
    pub student_id: String,
    pub already_signed_in: bool,
}
