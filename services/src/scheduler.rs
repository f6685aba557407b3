//! Background loops: the device's offline sync and connectivity polling, and
//! the server's session reaper.
//!
//! Both expose `tick()` so tests can drive a single pass without timers.

use crate::connectivity::{Connectivity, ConnectivityProbe};
use crate::error::AppError;
use crate::session_store::SessionStore;
use crate::sync_reconciler::SyncReconciler;
use chrono::Duration as ChronoDuration;
use db::repositories::SessionRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use util::clock::SharedClock;
use util::config::AppConfig;

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Running {
    async fn stop(self, name: &str) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!(task = name, error = %e, "background task did not stop cleanly");
        }
    }
}

#[derive(Clone)]
struct SyncDriver {
    reconciler: Arc<SyncReconciler>,
    connectivity: Connectivity,
}

impl SyncDriver {
    async fn tick(&self) -> bool {
        if !self.connectivity.is_online() {
            tracing::debug!("offline; sync skipped");
            return false;
        }
        self.reconciler.try_sync_all().await
    }
}

/// Syncs on a fixed interval and whenever connectivity comes back.
pub struct SyncScheduler {
    driver: SyncDriver,
    interval: Duration,
    running: Option<Running>,
}

impl SyncScheduler {
    pub fn new(reconciler: Arc<SyncReconciler>, connectivity: Connectivity) -> Self {
        let secs = AppConfig::global().sync_interval_secs;
        Self {
            driver: SyncDriver {
                reconciler,
                connectivity,
            },
            interval: Duration::from_secs(secs.max(1)),
            running: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// One sync pass if online. Returns the reconciler's result.
    pub async fn tick(&self) -> bool {
        self.driver.tick().await
    }

    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }
        let (shutdown, mut stop) = watch::channel(false);
        let driver = self.driver.clone();
        let period = self.interval;
        let mut network = driver.connectivity.subscribe();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = interval.tick() => {
                        driver.tick().await;
                    }
                    changed = network.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *network.borrow_and_update() {
                            tracing::info!("connectivity regained; syncing");
                            driver.tick().await;
                        }
                    }
                }
            }
            tracing::info!("sync scheduler stopped");
        });

        self.running = Some(Running { shutdown, handle });
        tracing::info!(interval_secs = period.as_secs(), "sync scheduler started");
    }

    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop("sync").await;
        }
    }
}

/// Polls a [`ConnectivityProbe`] and records each answer, which is what
/// fires [`SyncScheduler`]'s reconnect trigger.
pub struct ConnectivityMonitor {
    connectivity: Connectivity,
    probe: Arc<dyn ConnectivityProbe>,
    interval: Duration,
    running: Option<Running>,
}

impl ConnectivityMonitor {
    pub fn new(connectivity: Connectivity, probe: Arc<dyn ConnectivityProbe>) -> Self {
        let secs = AppConfig::global().connectivity_probe_secs;
        Self {
            connectivity,
            probe,
            interval: Duration::from_secs(secs.max(1)),
            running: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Probe once and record the result.
    pub async fn tick(&self) -> bool {
        self.connectivity.refresh(self.probe.as_ref()).await
    }

    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }
        let (shutdown, mut stop) = watch::channel(false);
        let connectivity = self.connectivity.clone();
        let probe = self.probe.clone();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = interval.tick() => {
                        connectivity.refresh(probe.as_ref()).await;
                    }
                }
            }
            tracing::info!("connectivity monitor stopped");
        });

        self.running = Some(Running { shutdown, handle });
        tracing::info!(interval_secs = period.as_secs(), "connectivity monitor started");
    }

    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop("connectivity").await;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub expired: usize,
    pub archived: usize,
}

#[derive(Clone)]
struct ReapDriver {
    store: Arc<SessionStore>,
    repo: SessionRepository,
    clock: SharedClock,
    archive_after: ChronoDuration,
}

impl ReapDriver {
    async fn tick(&self) -> Result<ReapReport, AppError> {
        let expired = self.store.cleanup_expired().await?;
        for session in &expired {
            self.repo.delete_session(&session.id).await?;
        }

        let now = self.clock.now();
        let mut archived = 0;
        for row in self.repo.ended_before(now - self.archive_after).await? {
            self.repo.archive_session(&row.id, now).await?;
            archived += 1;
        }
        Ok(ReapReport {
            expired: expired.len(),
            archived,
        })
    }
}

/// Expires ended sessions from the store and archives long-finished ones.
pub struct SessionReaper {
    driver: ReapDriver,
    interval: Duration,
    running: Option<Running>,
}

impl SessionReaper {
    pub fn new(store: Arc<SessionStore>, repo: SessionRepository, clock: SharedClock) -> Self {
        let config = AppConfig::global();
        Self {
            driver: ReapDriver {
                store,
                repo,
                clock,
                archive_after: ChronoDuration::hours(config.archive_after_hours),
            },
            interval: Duration::from_secs(config.session_cleanup_interval_secs.max(1)),
            running: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_archive_after(mut self, archive_after: ChronoDuration) -> Self {
        self.driver.archive_after = archive_after;
        self
    }

    pub async fn tick(&self) -> Result<ReapReport, AppError> {
        self.driver.tick().await
    }

    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }
        let (shutdown, mut stop) = watch::channel(false);
        let driver = self.driver.clone();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = interval.tick() => {
                        match driver.tick().await {
                            Ok(report) if report != ReapReport::default() => {
                                tracing::info!(expired = report.expired, archived = report.archived, "session reaper pass");
                            }
                            Ok(_) => {}
                            Err(e) => tracing::error!(error = %e, "session reaper pass failed"),
                        }
                    }
                }
            }
            tracing::info!("session reaper stopped");
        });

        self.running = Some(Running { shutdown, handle });
    }

    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop("reaper").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance_merger::AttendanceMerger;
    use crate::document_store::{DocumentStore, SqlDocumentStore};
    use crate::identity::NoProfiles;
    use crate::local_cache::{LocalCache, SqlLocalCache};
    use crate::models::{AttendanceSession, DisplayMeta};
    use crate::offline_queue::OfflineQueue;
    use crate::token;
    use crate::validation::AttendanceValidator;
    use chrono::{DateTime, TimeZone, Utc};
    use db::models::attendance_session::Model as SessionRow;
    use db::test_utils::setup_test_db;
    use util::clock::ManualClock;
    use util::events::EventBus;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap()
    }

    struct Fixture {
        repo: SessionRepository,
        store: Arc<SessionStore>,
        queue: Arc<OfflineQueue>,
        reconciler: Arc<SyncReconciler>,
        clock: ManualClock,
    }

    async fn fixture() -> Fixture {
        let db = setup_test_db().await;
        let repo = SessionRepository::new(db.clone());
        let cache: Arc<dyn LocalCache> = Arc::new(SqlLocalCache::new(db.clone()));
        let docs: Arc<dyn DocumentStore> = Arc::new(SqlDocumentStore::new(db));
        let clock = ManualClock::new(t0());
        let shared: SharedClock = Arc::new(clock.clone());

        let row = repo
            .insert_session(SessionRow::new("s1", "COS301", "SE", "k1", t0(), 60))
            .await
            .unwrap();
        let store = Arc::new(SessionStore::new(cache.clone(), docs.clone(), shared.clone()));
        store
            .add_active_session(AttendanceSession::from_row(row, DisplayMeta::default()))
            .await
            .unwrap();

        let merger = Arc::new(AttendanceMerger::new(docs, repo.clone(), Arc::new(NoProfiles), shared.clone()));
        let validator = Arc::new(AttendanceValidator::new(repo.clone(), merger, shared.clone()));
        let queue = Arc::new(OfflineQueue::new(cache, shared.clone()));
        let reconciler = Arc::new(SyncReconciler::new(validator, queue.clone(), shared));
        Fixture { repo, store, queue, reconciler, clock }
    }

    async fn queue_one(f: &Fixture) {
        f.queue
            .enqueue(&token::encode("s1", "COS301", "k1", t0()), "u1", None, t0() + ChronoDuration::minutes(1))
            .await
            .unwrap();
        f.clock.advance(ChronoDuration::minutes(2));
    }

    fn connectivity(f: &Fixture, online: bool) -> Connectivity {
        Connectivity::new(online, EventBus::new(Arc::new(f.clock.clone())), Arc::new(f.clock.clone()))
    }

    #[tokio::test]
    async fn tick_only_syncs_when_online() {
        let f = fixture().await;
        queue_one(&f).await;
        let net = connectivity(&f, false);
        let scheduler = SyncScheduler::new(f.reconciler.clone(), net.clone());

        assert!(!scheduler.tick().await);
        assert_eq!(f.queue.entries().await.unwrap().len(), 1);

        net.set_online(true).await;
        assert!(scheduler.tick().await);
        assert!(f.queue.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn regained_connectivity_triggers_sync() {
        let f = fixture().await;
        queue_one(&f).await;
        let net = connectivity(&f, false);
        let mut scheduler =
            SyncScheduler::new(f.reconciler.clone(), net.clone()).with_interval(Duration::from_secs(3600));
        scheduler.start();
        assert!(scheduler.is_running());

        net.set_online(true).await;
        let mut drained = false;
        for _ in 0..100 {
            if f.queue.entries().await.unwrap().is_empty() {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(drained);

        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }

    struct Switch(std::sync::atomic::AtomicBool);

    #[async_trait::async_trait]
    impl ConnectivityProbe for Switch {
        async fn probe(&self) -> bool {
            self.0.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn monitor_drives_reconnect_sync() {
        let f = fixture().await;
        queue_one(&f).await;
        let net = connectivity(&f, false);
        let switch = Arc::new(Switch(std::sync::atomic::AtomicBool::new(false)));

        let mut monitor =
            ConnectivityMonitor::new(net.clone(), switch.clone()).with_interval(Duration::from_millis(10));
        assert!(!monitor.tick().await);
        let mut scheduler =
            SyncScheduler::new(f.reconciler.clone(), net.clone()).with_interval(Duration::from_secs(3600));
        scheduler.start();
        monitor.start();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.queue.entries().await.unwrap().len(), 1);

        switch.0.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut drained = false;
        for _ in 0..100 {
            if f.queue.entries().await.unwrap().is_empty() {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(drained);
        assert!(net.is_online());

        monitor.stop().await;
        scheduler.stop().await;
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn reaper_expires_then_archives() {
        let f = fixture().await;
        let reaper = SessionReaper::new(f.store.clone(), f.repo.clone(), Arc::new(f.clock.clone()))
            .with_archive_after(ChronoDuration::hours(24));

        assert_eq!(reaper.tick().await.unwrap(), ReapReport::default());

        f.clock.advance(ChronoDuration::minutes(61));
        let report = reaper.tick().await.unwrap();
        assert_eq!(report, ReapReport { expired: 1, archived: 0 });
        assert!(f.store.get_session("s1").await.is_none());
        assert!(f.repo.find_session("s1").await.unwrap().is_none());
        assert!(f.repo.find_offline_session("s1").await.unwrap().is_some());

        f.clock.advance(ChronoDuration::hours(24));
        let report = reaper.tick().await.unwrap();
        assert_eq!(report, ReapReport { expired: 0, archived: 1 });
        assert!(f.repo.find_offline_session("s1").await.unwrap().is_none());
        assert!(f.repo.find_archived("s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reaper_start_stop() {
        let f = fixture().await;
        let mut reaper = SessionReaper::new(f.store.clone(), f.repo.clone(), Arc::new(f.clock.clone()))
            .with_interval(Duration::from_millis(10));
        reaper.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        reaper.stop().await;
        assert!(f.store.get_session("s1").await.is_some());
    }
}
