use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::attendance_session;

/// Fallback copy of a session row. Written alongside the live row and kept
/// after the live row is reaped so late offline replays can still be judged.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "offline_attendance_sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub course_code: String,
    pub course_name: String,
    pub temporal_key: String,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub restrict_by_ip: bool,
    pub allowed_ip_cidr: Option<String>,
    pub device_binding: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<attendance_session::Model> for Model {
    fn from(m: attendance_session::Model) -> Self {
        Self {
            id: m.id,
            course_code: m.course_code,
            course_name: m.course_name,
            temporal_key: m.temporal_key,
            starts_at: m.starts_at,
            expires_at: m.expires_at,
            duration_minutes: m.duration_minutes,
            restrict_by_ip: m.restrict_by_ip,
            allowed_ip_cidr: m.allowed_ip_cidr,
            device_binding: m.device_binding,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

impl From<Model> for attendance_session::Model {
    fn from(m: Model) -> Self {
        Self {
            id: m.id,
            course_code: m.course_code,
            course_name: m.course_name,
            temporal_key: m.temporal_key,
            starts_at: m.starts_at,
            expires_at: m.expires_at,
            duration_minutes: m.duration_minutes,
            restrict_by_ip: m.restrict_by_ip,
            allowed_ip_cidr: m.allowed_ip_cidr,
            device_binding: m.device_binding,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}
