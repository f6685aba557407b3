//! Device-side composition root: one owner for the local cache, offline
//! queue, credential store and the background sync loops.

use crate::connectivity::{Connectivity, ConnectivityProbe, HttpProbe};
use crate::credential_cache::CredentialCache;
use crate::crypto_vault::{HardwareSignals, IV_LEN};
use crate::error::AppError;
use crate::local_cache::{LocalCache, SqlLocalCache};
use crate::models::{AttendanceResult, DeviceCredential, Identity};
use crate::offline_queue::OfflineQueue;
use crate::scan_processor::ScanProcessor;
use crate::scheduler::{ConnectivityMonitor, SyncScheduler};
use crate::sync_reconciler::{SyncReconciler, SyncStatus};
use crate::validation::{HttpValidationClient, ValidationFunction};
use rand::RngCore;
use sea_orm::DatabaseConnection;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use util::clock::{SharedClock, system_clock};
use util::config::AppConfig;
use util::events::EventBus;

const CREDENTIAL_KEY_LEN: usize = 32;

struct Background {
    scheduler: SyncScheduler,
    monitor: ConnectivityMonitor,
}

pub struct DeviceRuntime {
    credentials: Arc<CredentialCache>,
    queue: Arc<OfflineQueue>,
    reconciler: Arc<SyncReconciler>,
    processor: ScanProcessor,
    connectivity: Connectivity,
    probe: Arc<dyn ConnectivityProbe>,
    events: EventBus,
    sync_interval: Duration,
    probe_interval: Duration,
    background: Mutex<Option<Background>>,
}

impl DeviceRuntime {
    pub fn new(
        cache: Arc<dyn LocalCache>,
        validator: Arc<dyn ValidationFunction>,
        probe: Arc<dyn ConnectivityProbe>,
        clock: SharedClock,
        signals: HardwareSignals,
    ) -> Self {
        let (sync_secs, probe_secs) = {
            let cfg = AppConfig::global();
            (cfg.sync_interval_secs, cfg.connectivity_probe_secs)
        };
        let events = EventBus::new(clock.clone());
        let connectivity = Connectivity::new(false, events.clone(), clock.clone());
        let credentials = Arc::new(CredentialCache::new(cache.clone(), clock.clone(), signals));
        let queue = Arc::new(OfflineQueue::new(cache, clock.clone()));
        let reconciler = Arc::new(SyncReconciler::new(validator.clone(), queue.clone(), clock.clone()));
        let processor = ScanProcessor::new(
            validator,
            queue.clone(),
            credentials.clone(),
            connectivity.clone(),
            events.clone(),
            clock,
        );

        Self {
            credentials,
            queue,
            reconciler,
            processor,
            connectivity,
            probe,
            events,
            sync_interval: Duration::from_secs(sync_secs.max(1)),
            probe_interval: Duration::from_secs(probe_secs.max(1)),
            background: Mutex::new(None),
        }
    }

    /// Wire the runtime against an opened device cache and the validation
    /// server named in the config.
    pub fn from_config(db: DatabaseConnection) -> Result<Self, AppError> {
        let validator = HttpValidationClient::from_config()?;
        let probe = HttpProbe::from_config()
            .map_err(|e| AppError::InvalidInput(format!("HTTP client: {e}")))?;
        Ok(Self::new(
            Arc::new(SqlLocalCache::new(db)),
            Arc::new(validator),
            Arc::new(probe),
            system_clock(),
            HardwareSignals::collect(),
        ))
    }

    pub fn with_intervals(mut self, sync: Duration, probe: Duration) -> Self {
        self.sync_interval = sync;
        self.probe_interval = probe;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.processor = self.processor.with_timeout(timeout);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Cache a fresh credential for `identity` under a newly generated key.
    pub async fn sign_in(&self, identity: Identity) -> Result<DeviceCredential, AppError> {
        if identity.user_id.trim().is_empty() {
            return Err(AppError::InvalidInput("user_id must not be empty".into()));
        }
        let mut key = [0u8; CREDENTIAL_KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        {
            let mut rng = rand::rng();
            rng.fill_bytes(&mut key);
            rng.fill_bytes(&mut iv);
        }
        let ttl_hours = AppConfig::global().credential_ttl_hours;
        let credential = self
            .credentials
            .store(identity, &key, &iv, ttl_hours, BTreeMap::new())
            .await?;
        tracing::info!(user_id = %credential.claims.user_id, ttl_hours, "device signed in");
        Ok(credential)
    }

    pub async fn sign_out(&self) -> Result<(), AppError> {
        self.credentials.clear().await?;
        tracing::info!("device signed out");
        Ok(())
    }

    pub async fn signed_in(&self) -> Option<DeviceCredential> {
        self.credentials.get().await
    }

    pub async fn process_scan(&self, raw_token: &str) -> Result<AttendanceResult, AppError> {
        self.processor.process_scan(raw_token).await
    }

    /// Probe once, then replay the queue if the probe found the server.
    pub async fn sync_now(&self) -> bool {
        if !self.connectivity.refresh(self.probe.as_ref()).await {
            tracing::info!("sync skipped: offline");
            return false;
        }
        self.reconciler.try_sync_all().await
    }

    pub async fn status(&self) -> Result<SyncStatus, AppError> {
        self.reconciler.status().await
    }

    pub async fn clear_failed(&self) -> Result<usize, AppError> {
        self.reconciler.clear_failed().await
    }

    pub async fn purge_expired(&self) -> Result<usize, AppError> {
        self.queue.purge_expired().await
    }

    pub async fn is_running(&self) -> bool {
        self.background.lock().await.is_some()
    }

    /// Take an initial connectivity reading and start the sync and probe loops.
    pub async fn start(&self) {
        let mut background = self.background.lock().await;
        if background.is_some() {
            return;
        }
        self.connectivity.refresh(self.probe.as_ref()).await;

        let mut scheduler = SyncScheduler::new(self.reconciler.clone(), self.connectivity.clone())
            .with_interval(self.sync_interval);
        let mut monitor = ConnectivityMonitor::new(self.connectivity.clone(), self.probe.clone())
            .with_interval(self.probe_interval);
        scheduler.start();
        monitor.start();
        *background = Some(Background { scheduler, monitor });
        tracing::info!(online = self.connectivity.is_online(), "device runtime started");
    }

    pub async fn stop(&self) {
        let running = self.background.lock().await.take();
        if let Some(mut bg) = running {
            bg.monitor.stop().await;
            bg.scheduler.stop().await;
            tracing::info!("device runtime stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance_merger::AttendanceMerger;
    use crate::document_store::{DocumentStore, SqlDocumentStore};
    use crate::identity::NoProfiles;
    use crate::models::Role;
    use crate::token;
    use crate::validation::AttendanceValidator;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use db::models::attendance_session::Model as SessionRow;
    use db::repositories::SessionRepository;
    use db::test_utils::setup_test_db;
    use std::sync::atomic::{AtomicBool, Ordering};
    use util::clock::ManualClock;

    struct Switch(AtomicBool);

    #[async_trait]
    impl ConnectivityProbe for Switch {
        async fn probe(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap()
    }

    fn signals() -> HardwareSignals {
        HardwareSignals {
            screen_width: 1280,
            screen_height: 800,
            color_depth: 24,
            timezone: "Africa/Johannesburg".into(),
            platform: "linux-x86_64".into(),
            cpu_cores: 4,
            font_probe: "110010".into(),
            gpu_renderer: "llvmpipe".into(),
            audio_sample_rate: 44_100,
        }
    }

    fn student() -> Identity {
        Identity {
            user_id: "user-9".into(),
            role: Role::Student,
            role_identifier: Some("23/1001".into()),
        }
    }

    struct Fixture {
        runtime: DeviceRuntime,
        repo: SessionRepository,
        switch: Arc<Switch>,
        clock: ManualClock,
    }

    async fn fixture() -> Fixture {
        let server_db = setup_test_db().await;
        let device_db = setup_test_db().await;
        let repo = SessionRepository::new(server_db.clone());
        let docs: Arc<dyn DocumentStore> = Arc::new(SqlDocumentStore::new(server_db));
        let clock = ManualClock::new(t0());
        let shared: SharedClock = Arc::new(clock.clone());

        repo.insert_session(SessionRow::new("s1", "COS301", "SE", "k1", t0(), 60))
            .await
            .unwrap();
        let merger = Arc::new(AttendanceMerger::new(docs, repo.clone(), Arc::new(NoProfiles), shared.clone()));
        let validator = Arc::new(AttendanceValidator::new(repo.clone(), merger, shared.clone()));
        let switch = Arc::new(Switch(AtomicBool::new(false)));

        let runtime = DeviceRuntime::new(
            Arc::new(SqlLocalCache::new(device_db)),
            validator,
            switch.clone(),
            shared,
            signals(),
        )
        .with_intervals(Duration::from_secs(3600), Duration::from_millis(10))
        .with_timeout(Duration::from_millis(200));

        Fixture {
            runtime,
            repo,
            switch,
            clock,
        }
    }

    #[tokio::test]
    async fn scanning_requires_sign_in() {
        let f = fixture().await;
        let raw = token::encode("s1", "COS301", "k1", t0());
        assert!(matches!(
            f.runtime.process_scan(&raw).await,
            Err(AppError::NotAuthenticated)
        ));

        let credential = f.runtime.sign_in(student()).await.unwrap();
        assert_eq!(credential.claims.user_id, "user-9");
        assert!(f.runtime.signed_in().await.is_some());

        f.runtime.sign_out().await.unwrap();
        assert!(f.runtime.signed_in().await.is_none());
    }

    #[tokio::test]
    async fn blank_user_id_is_refused() {
        let f = fixture().await;
        let mut who = student();
        who.user_id = "  ".into();
        assert!(matches!(f.runtime.sign_in(who).await, Err(AppError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn offline_scan_is_queued_then_synced_when_probe_recovers() {
        let f = fixture().await;
        f.runtime.sign_in(student()).await.unwrap();
        f.runtime.start().await;
        assert!(f.runtime.is_running().await);
        assert!(!f.runtime.connectivity().is_online());

        f.clock.advance(ChronoDuration::minutes(2));
        let raw = token::encode("s1", "COS301", "k1", t0());
        let res = f.runtime.process_scan(&raw).await.unwrap();
        assert!(matches!(res, AttendanceResult::RecordedOffline { .. }));
        assert_eq!(f.runtime.status().await.unwrap().counts.pending, 1);

        f.switch.0.store(true, Ordering::SeqCst);
        let mut drained = false;
        for _ in 0..100 {
            if f.runtime.status().await.unwrap().counts.pending == 0 {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(drained);
        assert!(f.repo.find_record("s1", "23/1001").await.unwrap().is_some());

        f.runtime.stop().await;
        assert!(!f.runtime.is_running().await);
    }

    #[tokio::test]
    async fn sync_now_skips_while_offline() {
        let f = fixture().await;
        assert!(!f.runtime.sync_now().await);
        f.switch.0.store(true, Ordering::SeqCst);
        assert!(f.runtime.sync_now().await);
        assert!(f.runtime.status().await.unwrap().last_sync_at.is_some());
    }
}
