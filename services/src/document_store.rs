//! Per-course attendance documents.
//!
//! A document is keyed by course code and holds one [`SessionEvent`] per
//! session, keyed `"<session_id>_<YYYY-MM-DD>"`.

use crate::error::AppError;
use crate::models::AttendanceRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db::models::attendance_document::{self, Entity as DocumentEntity};
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveValue::Set, DatabaseConnection, EntityTrait};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

pub const SESSION_EVENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Active,
    Completed,
    Expired,
}

/// One session's entry in a course document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SessionEventWire")]
pub struct SessionEvent {
    pub schema_version: u32,
    pub session_id: String,
    pub status: EventStatus,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub actual_end: Option<DateTime<Utc>>,
    pub records: BTreeMap<String, AttendanceRecord>,
}

#[derive(Deserialize)]
struct SessionEventWire {
    schema_version: u32,
    session_id: String,
    status: EventStatus,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    #[serde(default)]
    actual_end: Option<DateTime<Utc>>,
    #[serde(default)]
    records: BTreeMap<String, AttendanceRecord>,
}

impl TryFrom<SessionEventWire> for SessionEvent {
    type Error = String;

    fn try_from(w: SessionEventWire) -> Result<Self, Self::Error> {
        if w.schema_version != SESSION_EVENT_SCHEMA_VERSION {
            return Err(format!(
                "unsupported session event schema_version {} (expected {})",
                w.schema_version, SESSION_EVENT_SCHEMA_VERSION
            ));
        }
        Ok(Self {
            schema_version: w.schema_version,
            session_id: w.session_id,
            status: w.status,
            starts_at: w.starts_at,
            ends_at: w.ends_at,
            actual_end: w.actual_end,
            records: w.records,
        })
    }
}

impl SessionEvent {
    pub fn active(session_id: &str, starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: SESSION_EVENT_SCHEMA_VERSION,
            session_id: session_id.to_owned(),
            status: EventStatus::Active,
            starts_at,
            ends_at,
            actual_end: None,
            records: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseDocument {
    pub course_code: String,
    pub events: BTreeMap<String, SessionEvent>,
}

/// Nested updates applied to one event of a document.
#[derive(Debug, Clone)]
pub enum EventUpdate {
    Status {
        status: EventStatus,
        actual_end: Option<DateTime<Utc>>,
    },
    Records(BTreeMap<String, AttendanceRecord>),
}

pub fn event_key(session_id: &str, starts_at: DateTime<Utc>) -> String {
    format!("{}_{}", session_id, starts_at.format("%Y-%m-%d"))
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_document(&self, course_code: &str) -> Result<Option<CourseDocument>, AppError>;

    /// Create or replace one event field, creating the document if absent.
    async fn create_field(
        &self,
        course_code: &str,
        event_key: &str,
        event: SessionEvent,
    ) -> Result<(), AppError>;

    /// Fails with `NotFound` when the document or the event is missing.
    async fn update_nested_field(
        &self,
        course_code: &str,
        event_key: &str,
        update: EventUpdate,
    ) -> Result<SessionEvent, AppError>;

    async fn delete_document(&self, course_code: &str) -> Result<(), AppError>;

    async fn get_event(
        &self,
        course_code: &str,
        event_key: &str,
    ) -> Result<Option<SessionEvent>, AppError> {
        Ok(self
            .get_document(course_code)
            .await?
            .and_then(|mut doc| doc.events.remove(event_key)))
    }
}

/// [`DocumentStore`] over the `attendance_documents` table. Each document is
/// one JSON body; read-modify-write cycles are serialized by `write_lock`.
pub struct SqlDocumentStore {
    db: DatabaseConnection,
    write_lock: Mutex<()>,
}

impl SqlDocumentStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self, course_code: &str) -> Result<Option<CourseDocument>, AppError> {
        match DocumentEntity::find_by_id(course_code.to_owned())
            .one(&self.db)
            .await?
        {
            Some(row) => Ok(Some(serde_json::from_str(&row.body)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, doc: &CourseDocument) -> Result<(), AppError> {
        let row = attendance_document::ActiveModel {
            course_code: Set(doc.course_code.clone()),
            body: Set(serde_json::to_string(doc)?),
            updated_at: Set(Utc::now()),
        };
        DocumentEntity::insert(row)
            .on_conflict(
                OnConflict::column(attendance_document::Column::CourseCode)
                    .update_columns([
                        attendance_document::Column::Body,
                        attendance_document::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqlDocumentStore {
    async fn get_document(&self, course_code: &str) -> Result<Option<CourseDocument>, AppError> {
        self.load(course_code).await
    }

    async fn create_field(
        &self,
        course_code: &str,
        event_key: &str,
        event: SessionEvent,
    ) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load(course_code).await?.unwrap_or_else(|| CourseDocument {
            course_code: course_code.to_owned(),
            events: BTreeMap::new(),
        });
        doc.events.insert(event_key.to_owned(), event);
        self.save(&doc).await
    }

    async fn update_nested_field(
        &self,
        course_code: &str,
        event_key: &str,
        update: EventUpdate,
    ) -> Result<SessionEvent, AppError> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self
            .load(course_code)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Attendance document {course_code}")))?;
        let event = doc
            .events
            .get_mut(event_key)
            .ok_or_else(|| AppError::not_found(format!("Session event {event_key}")))?;

        match update {
            EventUpdate::Status { status, actual_end } => {
                event.status = status;
                if actual_end.is_some() {
                    event.actual_end = actual_end;
                }
            }
            EventUpdate::Records(records) => event.records = records,
        }
        let updated = event.clone();
        self.save(&doc).await?;
        Ok(updated)
    }

    async fn delete_document(&self, course_code: &str) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        DocumentEntity::delete_by_id(course_code.to_owned())
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use db::test_utils::setup_test_db;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap()
    }

    #[test]
    fn event_key_uses_session_start_date() {
        assert_eq!(event_key("abc", t0()), "abc_2025-03-03");
    }

    #[test]
    fn unknown_schema_version_fails_loudly() {
        let mut v = serde_json::to_value(SessionEvent::active("s", t0(), t0())).unwrap();
        v["schema_version"] = 2.into();
        let err = serde_json::from_value::<SessionEvent>(v).unwrap_err();
        assert!(err.to_string().contains("unsupported session event schema_version 2"));
    }

    #[tokio::test]
    async fn create_update_delete() {
        let store = SqlDocumentStore::new(setup_test_db().await);
        let key = event_key("s1", t0());
        store
            .create_field("COS301", &key, SessionEvent::active("s1", t0(), t0() + Duration::hours(1)))
            .await
            .unwrap();

        let end = t0() + Duration::minutes(30);
        let ev = store
            .update_nested_field(
                "COS301",
                &key,
                EventUpdate::Status { status: EventStatus::Completed, actual_end: Some(end) },
            )
            .await
            .unwrap();
        assert_eq!(ev.status, EventStatus::Completed);
        assert_eq!(ev.actual_end, Some(end));

        let fetched = store.get_event("COS301", &key).await.unwrap().unwrap();
        assert_eq!(fetched, ev);

        store.delete_document("COS301").await.unwrap();
        assert!(store.get_document("COS301").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn updating_missing_event_is_not_found() {
        let store = SqlDocumentStore::new(setup_test_db().await);
        let err = store
            .update_nested_field("COS301", "nope", EventUpdate::Records(BTreeMap::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
