//! Application state container shared across Axum route handlers.

use db::repositories::SessionRepository;
use sea_orm::DatabaseConnection;
use services::attendance_merger::AttendanceMerger;
use services::document_store::{DocumentStore, SqlDocumentStore};
use services::error::AppError;
use services::identity::{NoProfiles, ProfileSource};
use services::local_cache::{LocalCache, SqlLocalCache};
use services::session_admin::SessionAdmin;
use services::session_store::SessionStore;
use services::temporal_key::TemporalKeyRotator;
use services::validation::AttendanceValidator;
use std::sync::Arc;
use util::clock::SharedClock;
use util::events::EventBus;

/// Central application state shared across the server.
///
/// Every component is constructed once here and handed out by reference;
/// cloning the state only clones `Arc`s.
#[derive(Clone)]
pub struct AppState {
    db: DatabaseConnection,
    repo: SessionRepository,
    store: Arc<SessionStore>,
    admin: Arc<SessionAdmin>,
    rotator: Arc<TemporalKeyRotator>,
    validator: Arc<AttendanceValidator>,
    events: EventBus,
    clock: SharedClock,
}

impl AppState {
    /// Wire the server-side components over `db` with no profile directory.
    pub async fn init(db: DatabaseConnection, clock: SharedClock) -> Result<Self, AppError> {
        Self::init_with_profiles(db, clock, Arc::new(NoProfiles)).await
    }

    /// Wire the server-side components and replay the session mirror.
    pub async fn init_with_profiles(
        db: DatabaseConnection,
        clock: SharedClock,
        profiles: Arc<dyn ProfileSource>,
    ) -> Result<Self, AppError> {
        let repo = SessionRepository::new(db.clone());
        let documents: Arc<dyn DocumentStore> = Arc::new(SqlDocumentStore::new(db.clone()));
        let mirror: Arc<dyn LocalCache> = Arc::new(SqlLocalCache::new(db.clone()));
        let events = EventBus::new(clock.clone());

        let store = Arc::new(SessionStore::new(mirror, documents.clone(), clock.clone()));
        let merger = Arc::new(AttendanceMerger::new(
            documents.clone(),
            repo.clone(),
            profiles,
            clock.clone(),
        ));
        let validator = Arc::new(
            AttendanceValidator::new(repo.clone(), merger.clone(), clock.clone())
                .with_session_store(store.clone())
                .with_events(events.clone()),
        );
        let admin = Arc::new(SessionAdmin::new(
            repo.clone(),
            store.clone(),
            documents,
            merger,
            clock.clone(),
        ));
        let rotator = Arc::new(TemporalKeyRotator::new(repo.clone(), store.clone(), clock.clone()));

        let reaped = store.initialize().await?;
        for session in &reaped {
            repo.delete_session(&session.id).await?;
        }

        Ok(Self {
            db,
            repo,
            store,
            admin,
            rotator,
            validator,
            events,
            clock,
        })
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn repo(&self) -> &SessionRepository {
        &self.repo
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn admin(&self) -> &SessionAdmin {
        &self.admin
    }

    pub fn rotator(&self) -> &TemporalKeyRotator {
        &self.rotator
    }

    pub fn validator(&self) -> &AttendanceValidator {
        &self.validator
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }
}
