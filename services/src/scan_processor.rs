//! Device-side capture path: a live round-trip when the network allows,
//! otherwise a local queue entry for the reconciler to replay.

use crate::connectivity::{Connectivity, DEVICE_TOPIC};
use crate::credential_cache::CredentialCache;
use crate::error::AppError;
use crate::models::{AttendanceResult, ScanClaim};
use crate::offline_queue::{EnqueueOutcome, OfflineQueue};
use crate::token;
use crate::validation::{
    ScanRejection, ValidationFunction, ValidationOutcome, ValidationRequest, validate_with_budget,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use util::clock::SharedClock;
use util::config::AppConfig;
use util::events::{Event, EventBus};

#[derive(Debug, Serialize)]
pub struct OfflineAttendanceRecorded {
    pub queue_id: String,
    pub session_id: String,
    pub course_code: String,
    pub student_id: String,
    pub captured_at: DateTime<Utc>,
}

impl Event for OfflineAttendanceRecorded {
    const NAME: &'static str = "attendance.offline_recorded";

    fn topic_path(&self) -> String {
        DEVICE_TOPIC.into()
    }
}

pub struct ScanProcessor {
    validator: Arc<dyn ValidationFunction>,
    queue: Arc<OfflineQueue>,
    credentials: Arc<CredentialCache>,
    connectivity: Connectivity,
    events: EventBus,
    clock: SharedClock,
    timeout: Duration,
}

impl ScanProcessor {
    pub fn new(
        validator: Arc<dyn ValidationFunction>,
        queue: Arc<OfflineQueue>,
        credentials: Arc<CredentialCache>,
        connectivity: Connectivity,
        events: EventBus,
        clock: SharedClock,
    ) -> Self {
        let timeout = Duration::from_secs(AppConfig::global().network_timeout_secs);
        Self {
            validator,
            queue,
            credentials,
            connectivity,
            events,
            clock,
            timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Handle one scanned code for the signed-in device owner.
    ///
    /// Fails with [`AppError::NotAuthenticated`] when no trusted credential is
    /// cached. A token that does not decode is rejected before any network or
    /// queue work, so it can never be replayed.
    pub async fn process_scan(&self, raw_token: &str) -> Result<AttendanceResult, AppError> {
        let credential = self
            .credentials
            .get()
            .await
            .ok_or(AppError::NotAuthenticated)?;
        let student_id = credential.student_id().to_owned();
        let device_id = credential.claims.device_fingerprint.clone();

        let payload = match token::decode(raw_token) {
            Ok(p) => p,
            Err(e) => {
                return Ok(AttendanceResult::Rejected {
                    reason: ScanRejection::InvalidPayload(e.to_string()),
                });
            }
        };
        let now = self.clock.now();

        if self.connectivity.is_online() {
            let request = ValidationRequest {
                token: raw_token.to_owned(),
                claim: ScanClaim {
                    student_id: student_id.clone(),
                    scanned_at: now,
                    is_online: true,
                    device_id: Some(device_id.clone()),
                },
                client_ip: None,
            };
            match validate_with_budget(self.validator.as_ref(), request, self.timeout).await {
                Ok(response) => {
                    let session_id = response
                        .session
                        .as_ref()
                        .map(|s| s.id.clone())
                        .unwrap_or_else(|| payload.sid.clone());
                    return Ok(match response.outcome() {
                        ValidationOutcome::Accepted => AttendanceResult::Recorded {
                            session_id,
                            scanned_at: now,
                        },
                        ValidationOutcome::AlreadyScanned => {
                            AttendanceResult::AlreadyScanned { session_id }
                        }
                        ValidationOutcome::Rejected(reason) => {
                            AttendanceResult::Rejected { reason }
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(session_id = %payload.sid, error = %e, "live validation failed; queueing offline");
                }
            }
        }

        match self
            .queue
            .enqueue(raw_token, &student_id, Some(&device_id), now)
            .await?
        {
            EnqueueOutcome::Queued(entry) => {
                tracing::info!(queue_id = %entry.id, session_id = %payload.sid, "scan queued offline");
                self.events
                    .emit(&OfflineAttendanceRecorded {
                        queue_id: entry.id.clone(),
                        session_id: payload.sid,
                        course_code: payload.course,
                        student_id,
                        captured_at: entry.captured_at,
                    })
                    .await;
                Ok(AttendanceResult::RecordedOffline { queue_id: entry.id })
            }
            EnqueueOutcome::Duplicate(entry) => {
                Ok(AttendanceResult::Duplicate { queue_id: entry.id })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance_merger::AttendanceMerger;
    use crate::crypto_vault::HardwareSignals;
    use crate::document_store::{DocumentStore, SqlDocumentStore};
    use crate::identity::NoProfiles;
    use crate::local_cache::{LocalCache, SqlLocalCache};
    use crate::models::{Identity, QueueStatus, Role};
    use crate::validation::{AttendanceValidator, TransientNetworkError, ValidationResponse};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use db::models::attendance_session::Model as SessionRow;
    use db::repositories::SessionRepository;
    use db::test_utils::setup_test_db;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use util::clock::{Clock, ManualClock};

    struct Unreachable(AtomicUsize);

    #[async_trait]
    impl ValidationFunction for Unreachable {
        async fn validate(
            &self,
            _request: ValidationRequest,
        ) -> Result<ValidationResponse, TransientNetworkError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(TransientNetworkError::Unreachable("no route".into()))
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap()
    }

    fn signals() -> HardwareSignals {
        HardwareSignals {
            screen_width: 1080,
            screen_height: 2400,
            color_depth: 24,
            timezone: "Africa/Lagos".into(),
            platform: "android-aarch64".into(),
            cpu_cores: 8,
            font_probe: "010101".into(),
            gpu_renderer: "Mali-G57".into(),
            audio_sample_rate: 48_000,
        }
    }

    struct Fixture {
        repo: SessionRepository,
        queue: Arc<OfflineQueue>,
        credentials: Arc<CredentialCache>,
        connectivity: Connectivity,
        events: EventBus,
        clock: ManualClock,
        validator: Arc<AttendanceValidator>,
    }

    async fn fixture() -> Fixture {
        let db = setup_test_db().await;
        let repo = SessionRepository::new(db.clone());
        let cache: Arc<dyn LocalCache> = Arc::new(SqlLocalCache::new(db.clone()));
        let docs: Arc<dyn DocumentStore> = Arc::new(SqlDocumentStore::new(db));
        let clock = ManualClock::new(t0());
        let shared: SharedClock = Arc::new(clock.clone());
        let events = EventBus::new(shared.clone());

        let credentials = Arc::new(CredentialCache::new(cache.clone(), shared.clone(), signals()));
        credentials
            .store(
                Identity {
                    user_id: "user-7".into(),
                    role: Role::Student,
                    role_identifier: Some("22/0042".into()),
                },
                &[5u8; 16],
                &[1u8; 16],
                12,
                BTreeMap::new(),
            )
            .await
            .unwrap();

        repo.insert_session(SessionRow::new("s1", "COS301", "SE", "k1", t0(), 60))
            .await
            .unwrap();
        let merger = Arc::new(AttendanceMerger::new(docs, repo.clone(), Arc::new(NoProfiles), shared.clone()));
        let validator = Arc::new(AttendanceValidator::new(repo.clone(), merger, shared.clone()));

        Fixture {
            repo,
            queue: Arc::new(OfflineQueue::new(cache, shared.clone())),
            credentials,
            connectivity: Connectivity::new(true, events.clone(), shared),
            events,
            clock,
            validator,
        }
    }

    fn processor(f: &Fixture, validator: Arc<dyn ValidationFunction>) -> ScanProcessor {
        ScanProcessor::new(
            validator,
            f.queue.clone(),
            f.credentials.clone(),
            f.connectivity.clone(),
            f.events.clone(),
            Arc::new(f.clock.clone()),
        )
        .with_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn online_scan_is_recorded_under_matric_number() {
        let f = fixture().await;
        f.clock.advance(ChronoDuration::minutes(3));
        let p = processor(&f, f.validator.clone());
        let raw = token::encode("s1", "COS301", "k1", t0());

        let first = p.process_scan(&raw).await.unwrap();
        assert_eq!(
            first,
            AttendanceResult::Recorded {
                session_id: "s1".into(),
                scanned_at: f.clock.now()
            }
        );
        assert!(f.repo.find_record("s1", "22/0042").await.unwrap().is_some());

        let second = p.process_scan(&raw).await.unwrap();
        assert_eq!(second, AttendanceResult::AlreadyScanned { session_id: "s1".into() });
        assert!(f.queue.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_key_is_a_final_rejection() {
        let f = fixture().await;
        let p = processor(&f, f.validator.clone());
        let res = p.process_scan(&token::encode("s1", "COS301", "old", t0())).await.unwrap();
        assert_eq!(res, AttendanceResult::Rejected { reason: ScanRejection::StaleToken });
        assert_eq!(res.user_message(), "Code has changed, please rescan");
        assert!(f.queue.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_falls_back_to_queue_once() {
        let f = fixture().await;
        let remote = Arc::new(Unreachable(AtomicUsize::new(0)));
        let p = processor(&f, remote.clone());
        let mut rx = f.events.subscribe(DEVICE_TOPIC).await;
        let raw = token::encode("s1", "COS301", "k1", t0());

        let first = p.process_scan(&raw).await.unwrap();
        assert!(matches!(first, AttendanceResult::RecordedOffline { .. }));
        assert_eq!(remote.0.load(Ordering::SeqCst), 2);

        let again = p.process_scan(&raw).await.unwrap();
        assert!(matches!(again, AttendanceResult::Duplicate { .. }));

        let entries = f.queue.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, QueueStatus::Pending);
        assert_eq!(entries[0].student_id, "22/0042");

        let raw_event = rx.recv().await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw_event).unwrap();
        assert_eq!(v["event"], "attendance.offline_recorded");
        assert_eq!(v["payload"]["session_id"], "s1");
    }

    #[tokio::test]
    async fn offline_device_skips_network() {
        let f = fixture().await;
        f.connectivity.set_online(false).await;
        let remote = Arc::new(Unreachable(AtomicUsize::new(0)));
        let p = processor(&f, remote.clone());

        let res = p.process_scan(&token::encode("s1", "COS301", "k1", t0())).await.unwrap();
        assert!(matches!(res, AttendanceResult::RecordedOffline { .. }));
        assert_eq!(remote.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn garbage_is_rejected_and_never_queued() {
        let f = fixture().await;
        f.connectivity.set_online(false).await;
        let p = processor(&f, f.validator.clone());
        let res = p.process_scan("not-a-token").await.unwrap();
        assert!(matches!(
            res,
            AttendanceResult::Rejected { reason: ScanRejection::InvalidPayload(_) }
        ));
        assert!(f.queue.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn signed_out_device_cannot_scan() {
        let f = fixture().await;
        f.credentials.clear().await.unwrap();
        let p = processor(&f, f.validator.clone());
        let err = p
            .process_scan(&token::encode("s1", "COS301", "k1", t0()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotAuthenticated));
    }
}
