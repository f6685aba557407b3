//! Index of active attendance sessions by id and by course.
//!
//! Every mutation writes the whole set to the durable mirror first and only
//! then swaps the in-memory index, so memory is never ahead of disk.

use crate::document_store::{DocumentStore, EventStatus, EventUpdate, event_key};
use crate::error::AppError;
use crate::local_cache::{LocalCache, LocalCacheExt};
use crate::models::AttendanceSession;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use util::clock::SharedClock;

pub const ACTIVE_SESSIONS_KEY: &str = "active_sessions";

#[derive(Debug, Clone, Default)]
struct SessionIndex {
    by_id: HashMap<String, AttendanceSession>,
    by_course: HashMap<String, String>,
}

impl SessionIndex {
    fn from_sessions(sessions: Vec<AttendanceSession>) -> Self {
        let mut index = Self::default();
        for s in sessions {
            index.insert(s);
        }
        index
    }

    fn insert(&mut self, session: AttendanceSession) {
        self.by_course
            .insert(session.course_code.clone(), session.id.clone());
        self.by_id.insert(session.id.clone(), session);
    }

    fn remove(&mut self, id: &str) -> Option<AttendanceSession> {
        let removed = self.by_id.remove(id)?;
        if self.by_course.get(&removed.course_code).map(String::as_str) == Some(id) {
            self.by_course.remove(&removed.course_code);
            // Fall back to another session of the same course, if any.
            if let Some(other) = self
                .by_id
                .values()
                .filter(|s| s.course_code == removed.course_code)
                .max_by_key(|s| s.starts_at)
            {
                self.by_course
                    .insert(other.course_code.clone(), other.id.clone());
            }
        }
        Some(removed)
    }

    fn snapshot(&self) -> Vec<AttendanceSession> {
        let mut all: Vec<_> = self.by_id.values().cloned().collect();
        all.sort_by(|a, b| a.starts_at.cmp(&b.starts_at).then_with(|| a.id.cmp(&b.id)));
        all
    }
}

pub struct SessionStore {
    index: RwLock<SessionIndex>,
    mirror: Arc<dyn LocalCache>,
    documents: Arc<dyn DocumentStore>,
    clock: SharedClock,
}

impl SessionStore {
    pub fn new(
        mirror: Arc<dyn LocalCache>,
        documents: Arc<dyn DocumentStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            index: RwLock::new(SessionIndex::default()),
            mirror,
            documents,
            clock,
        }
    }

    /// Replay the mirror into memory, then reap sessions that ended while
    /// the process was down. Returns the reaped sessions.
    pub async fn initialize(&self) -> Result<Vec<AttendanceSession>, AppError> {
        let persisted: Vec<AttendanceSession> = self
            .mirror
            .get(ACTIVE_SESSIONS_KEY)
            .await?
            .unwrap_or_default();
        let count = persisted.len();
        *self.index.write().await = SessionIndex::from_sessions(persisted);
        tracing::info!(sessions = count, "session store restored from mirror");

        self.cleanup_expired().await
    }

    /// Drop the in-memory index. The mirror is kept for the next `initialize`.
    pub async fn dispose(&self) {
        *self.index.write().await = SessionIndex::default();
    }

    pub async fn get_active_sessions(&self) -> Vec<AttendanceSession> {
        self.index.read().await.snapshot()
    }

    pub async fn get_session(&self, id: &str) -> Option<AttendanceSession> {
        self.index.read().await.by_id.get(id).cloned()
    }

    pub async fn get_current_session(&self, course_code: &str) -> Option<AttendanceSession> {
        let index = self.index.read().await;
        index
            .by_course
            .get(course_code)
            .and_then(|id| index.by_id.get(id))
            .cloned()
    }

    /// The admission gate: a session for `course_code` is held and has not ended.
    pub async fn has_active_session(&self, course_code: &str) -> bool {
        let now = self.clock.now();
        self.get_current_session(course_code)
            .await
            .is_some_and(|s| !s.is_ended(now))
    }

    pub async fn add_active_session(&self, session: AttendanceSession) -> Result<(), AppError> {
        let id = session.id.clone();
        self.mutate(|index| {
            index.insert(session);
            Ok(())
        })
        .await?;
        tracing::info!(session_id = %id, "session added to store");
        Ok(())
    }

    pub async fn update_active_session(&self, session: AttendanceSession) -> Result<(), AppError> {
        self.mutate(|index| {
            if !index.by_id.contains_key(&session.id) {
                return Err(AppError::not_found(format!("Active session {}", session.id)));
            }
            index.insert(session);
            Ok(())
        })
        .await
    }

    pub async fn remove_active_session(
        &self,
        id: &str,
    ) -> Result<Option<AttendanceSession>, AppError> {
        let mut removed = None;
        self.mutate(|index| {
            removed = index.remove(id);
            Ok(())
        })
        .await?;
        Ok(removed)
    }

    /// Report every ended session to the document store as `Expired`, then
    /// drop them from the index and the mirror.
    pub async fn cleanup_expired(&self) -> Result<Vec<AttendanceSession>, AppError> {
        let now = self.clock.now();
        let expired: Vec<AttendanceSession> = self
            .get_active_sessions()
            .await
            .into_iter()
            .filter(|s| s.is_ended(now))
            .collect();
        if expired.is_empty() {
            return Ok(expired);
        }

        for session in &expired {
            let update = EventUpdate::Status {
                status: EventStatus::Expired,
                actual_end: Some(now),
            };
            let key = event_key(&session.id, session.starts_at);
            if let Err(e) = self
                .documents
                .update_nested_field(&session.course_code, &key, update)
                .await
            {
                tracing::warn!(session_id = %session.id, error = %e, "could not mark orphaned session expired");
            }
        }

        self.mutate(|index| {
            for session in &expired {
                index.remove(&session.id);
            }
            Ok(())
        })
        .await?;

        tracing::info!(reaped = expired.len(), "expired sessions reaped");
        Ok(expired)
    }

    /// Apply `change` to a copy of the index, persist the copy, then publish it.
    async fn mutate<F>(&self, change: F) -> Result<(), AppError>
    where
        F: FnOnce(&mut SessionIndex) -> Result<(), AppError>,
    {
        let mut index = self.index.write().await;
        let mut next = index.clone();
        change(&mut next)?;
        self.mirror.set(ACTIVE_SESSIONS_KEY, &next.snapshot()).await?;
        *index = next;
        Ok(())
    }
}
