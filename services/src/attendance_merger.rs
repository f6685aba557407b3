//! Folds scan claims into a session's authoritative record set.
//!
//! First writer wins on `has_scanned`; a later claim can only move an existing
//! record's scan time earlier. Live scans, replayed offline scans and manual
//! sign-ins all go through [`AttendanceMerger::apply`].

use crate::document_store::{DocumentStore, EventStatus, EventUpdate, SessionEvent, event_key};
use crate::error::AppError;
use crate::identity::{ProfileSource, resolve_profile};
use crate::models::{AttendanceRecord, ScanClaim};
use db::models::attendance_record::Model as RecordRow;
use db::models::attendance_session::Model as SessionRow;
use db::repositories::SessionRepository;
use std::sync::Arc;
use tokio::sync::Mutex;
use util::clock::SharedClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No scanned record existed; one was written from the claim.
    Inserted,
    /// Record already scanned; its scan time moved earlier.
    EarlierTime,
    /// Record already scanned at or before the claim; left untouched.
    Unchanged,
}

impl MergeOutcome {
    pub fn was_already_scanned(self) -> bool {
        !matches!(self, Self::Inserted)
    }
}

/// Pure merge rule for one claim against the current record, if any.
pub fn merge_claim(
    existing: Option<&AttendanceRecord>,
    claim: &ScanClaim,
    academic_level: Option<u16>,
) -> (AttendanceRecord, MergeOutcome) {
    match existing {
        Some(record) if record.has_scanned => {
            if claim.scanned_at < record.scanned_at {
                let mut moved = record.clone();
                moved.scanned_at = claim.scanned_at;
                (moved, MergeOutcome::EarlierTime)
            } else {
                (record.clone(), MergeOutcome::Unchanged)
            }
        }
        _ => (
            AttendanceRecord {
                student_id: claim.student_id.clone(),
                scanned_at: claim.scanned_at,
                has_scanned: true,
                is_online_scan: claim.is_online,
                device_id: claim.device_id.clone(),
                academic_level: academic_level
                    .or_else(|| existing.and_then(|r| r.academic_level)),
            },
            MergeOutcome::Inserted,
        ),
    }
}

pub struct AttendanceMerger {
    documents: Arc<dyn DocumentStore>,
    repo: SessionRepository,
    profiles: Arc<dyn ProfileSource>,
    clock: SharedClock,
    lock: Mutex<()>,
}

impl AttendanceMerger {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        repo: SessionRepository,
        profiles: Arc<dyn ProfileSource>,
        clock: SharedClock,
    ) -> Self {
        Self {
            documents,
            repo,
            profiles,
            clock,
            lock: Mutex::new(()),
        }
    }

    /// Apply `claims` in order and return one outcome per claim.
    pub async fn apply(
        &self,
        session: &SessionRow,
        claims: &[ScanClaim],
    ) -> Result<Vec<MergeOutcome>, AppError> {
        let _guard = self.lock.lock().await;
        let now = self.clock.now();
        let key = event_key(&session.id, session.starts_at);

        let mut event = match self.documents.get_event(&session.course_code, &key).await? {
            Some(event) => event,
            None => {
                let mut event = SessionEvent::active(&session.id, session.starts_at, session.expires_at);
                if session.is_ended(now) {
                    event.status = EventStatus::Completed;
                }
                self.documents
                    .create_field(&session.course_code, &key, event.clone())
                    .await?;
                event
            }
        };

        let mut outcomes = Vec::with_capacity(claims.len());
        let mut dirty = false;
        for claim in claims {
            let existing = event.records.get(&claim.student_id);
            let level = match existing {
                Some(r) if r.has_scanned => None,
                _ => resolve_profile(self.profiles.as_ref(), &claim.student_id, now)
                    .await
                    .level(),
            };

            let (record, outcome) = merge_claim(existing, claim, level);
            if outcome != MergeOutcome::Unchanged {
                self.repo
                    .save_record(RecordRow {
                        session_id: session.id.clone(),
                        student_id: record.student_id.clone(),
                        scanned_at: record.scanned_at,
                        is_online: record.is_online_scan,
                        device_id: record.device_id.clone(),
                    })
                    .await?;
                event.records.insert(record.student_id.clone(), record);
                dirty = true;
            }
            outcomes.push(outcome);
        }

        if dirty {
            self.documents
                .update_nested_field(&session.course_code, &key, EventUpdate::Records(event.records))
                .await?;
        }
        tracing::info!(session_id = %session.id, claims = claims.len(), "claims merged");
        Ok(outcomes)
    }
}
