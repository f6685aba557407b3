//! Lecturer-side session lifecycle: start, end, manual sign-in, archive.

use crate::attendance_merger::{AttendanceMerger, MergeOutcome};
use crate::document_store::{DocumentStore, EventStatus, EventUpdate, SessionEvent, event_key};
use crate::error::AppError;
use crate::models::{AttendanceSession, DisplayMeta, ScanClaim, SecurityFeatures};
use crate::session_store::SessionStore;
use crate::temporal_key::generate_key;
use crate::token;
use db::models::archived_session::Model as ArchivedRow;
use db::models::attendance_session::Model as SessionRow;
use db::repositories::SessionRepository;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use util::clock::SharedClock;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSession {
    pub course_code: String,
    pub course_name: String,
    pub duration_minutes: i64,
    #[serde(default)]
    pub display: DisplayMeta,
    #[serde(default)]
    pub security: SecurityFeatures,
    /// Signed in automatically when the session opens.
    #[serde(default)]
    pub course_rep: Option<String>,
}

pub struct SessionAdmin {
    repo: SessionRepository,
    store: Arc<SessionStore>,
    documents: Arc<dyn DocumentStore>,
    merger: Arc<AttendanceMerger>,
    clock: SharedClock,
}

impl SessionAdmin {
    pub fn new(
        repo: SessionRepository,
        store: Arc<SessionStore>,
        documents: Arc<dyn DocumentStore>,
        merger: Arc<AttendanceMerger>,
        clock: SharedClock,
    ) -> Self {
        Self {
            repo,
            store,
            documents,
            merger,
            clock,
        }
    }

    /// Open a session starting now. A course holds at most one live session.
    pub async fn start_session(&self, req: StartSession) -> Result<AttendanceSession, AppError> {
        let course_code = req.course_code.trim();
        if course_code.is_empty() {
            return Err(AppError::InvalidInput("course_code is required".into()));
        }
        if req.duration_minutes <= 0 {
            return Err(AppError::InvalidInput(
                "duration_minutes must be positive".into(),
            ));
        }
        if req.security.restrict_by_ip {
            match req.security.allowed_ip_cidr.as_deref().map(str::parse::<IpNet>) {
                Some(Ok(_)) => {}
                _ => {
                    return Err(AppError::InvalidInput(
                        "restrict_by_ip requires a valid allowed_ip_cidr".into(),
                    ));
                }
            }
        }
        if self.store.has_active_session(course_code).await {
            return Err(AppError::InvalidInput(format!(
                "Course {course_code} already has an active session"
            )));
        }

        let now = self.clock.now();
        let id = Uuid::new_v4().to_string();
        let mut row = SessionRow::new(
            &id,
            course_code,
            &req.course_name,
            &generate_key(),
            now,
            req.duration_minutes,
        );
        row.restrict_by_ip = req.security.restrict_by_ip;
        row.allowed_ip_cidr = req.security.allowed_ip_cidr.clone();
        row.device_binding = req.security.device_binding;
        let row = self.repo.insert_session(row).await?;

        self.documents
            .create_field(
                &row.course_code,
                &event_key(&row.id, row.starts_at),
                SessionEvent::active(&row.id, row.starts_at, row.expires_at),
            )
            .await?;

        let mut session = AttendanceSession::from_row(row.clone(), req.display);
        session.encoded_token = Some(token::encode_for(&session, now));
        self.store.add_active_session(session.clone()).await?;

        if let Some(rep) = req.course_rep.filter(|r| !r.trim().is_empty()) {
            self.merger
                .apply(&row, &[admin_claim(&rep, now)])
                .await?;
            tracing::info!(session_id = %row.id, student = %rep, "course rep signed in");
        }

        tracing::info!(
            session_id = %session.id,
            course = %session.course_code,
            ends_at = %session.ends_at,
            "attendance session started"
        );
        Ok(session)
    }

    /// Close a session early. The end time is pulled in to now so later
    /// offline replays are judged against the actual end.
    pub async fn end_session(&self, session_id: &str) -> Result<AttendanceSession, AppError> {
        let mut row = self
            .repo
            .find_session(session_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Session {session_id}")))?;
        let now = self.clock.now();
        if row.expires_at > now {
            row.expires_at = now;
            row.updated_at = now;
            row = self.repo.update_session(row).await?;
        }

        let update = EventUpdate::Status {
            status: EventStatus::Completed,
            actual_end: Some(now),
        };
        if let Err(e) = self
            .documents
            .update_nested_field(&row.course_code, &event_key(&row.id, row.starts_at), update)
            .await
        {
            tracing::warn!(session_id = %row.id, error = %e, "could not mark session completed");
        }

        let display = self
            .store
            .remove_active_session(session_id)
            .await?
            .map(|s| s.display)
            .unwrap_or_default();
        self.repo.delete_session(session_id).await?;

        tracing::info!(session_id = %row.id, course = %row.course_code, "attendance session ended");
        Ok(AttendanceSession::from_row(row, display))
    }

    /// Mark a student present by hand. Works on ended sessions too, as long
    /// as the fallback row still exists.
    pub async fn manual_sign_in(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<MergeOutcome, AppError> {
        let student_id = student_id.trim();
        if student_id.is_empty() {
            return Err(AppError::InvalidInput("student_id is required".into()));
        }
        let row = self
            .repo
            .find_session_or_fallback(session_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Session {session_id}")))?;
        let outcomes = self
            .merger
            .apply(&row, &[admin_claim(student_id, self.clock.now())])
            .await?;
        tracing::info!(session_id = %session_id, student = %student_id, "manual sign-in");
        Ok(outcomes.first().copied().unwrap_or(MergeOutcome::Unchanged))
    }

    pub async fn archive_session(&self, session_id: &str) -> Result<ArchivedRow, AppError> {
        if self.repo.find_session_or_fallback(session_id).await?.is_none() {
            return Err(AppError::not_found(format!("Session {session_id}")));
        }
        self.store.remove_active_session(session_id).await?;
        let archived = self.repo.archive_session(session_id, self.clock.now()).await?;
        tracing::info!(session_id = %session_id, "attendance session archived");
        Ok(archived)
    }
}

fn admin_claim(student_id: &str, at: chrono::DateTime<chrono::Utc>) -> ScanClaim {
    ScanClaim {
        student_id: student_id.to_owned(),
        scanned_at: at,
        is_online: true,
        device_id: None,
    }
}
