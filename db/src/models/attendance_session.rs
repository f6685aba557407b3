use chrono::{DateTime, Duration, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Live session row. One row per session while it is served to scanners.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "attendance_sessions")]
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
pub enum Relation {
    #[sea_orm(has_many = "super::attendance_record::Entity")]
    Records,
    #[sea_orm(has_many = "super::temporal_key_epoch::Entity")]
    KeyEpochs,
}

impl Related<super::attendance_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Records.def()
    }
}

impl Related<super::temporal_key_epoch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::KeyEpochs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn new(
        id: &str,
        course_code: &str,
        course_name: &str,
        temporal_key: &str,
        starts_at: DateTime<Utc>,
        duration_minutes: i64,
    ) -> Self {
        Self {
            id: id.to_owned(),
            course_code: course_code.to_owned(),
            course_name: course_name.to_owned(),
            temporal_key: temporal_key.to_owned(),
            starts_at,
            expires_at: starts_at + Duration::minutes(duration_minutes),
            duration_minutes,
            restrict_by_ip: false,
            allowed_ip_cidr: None,
            device_binding: false,
            created_at: starts_at,
            updated_at: starts_at,
        }
    }

    /// True once `now` is at or past the end of the window.
    pub fn is_ended(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
