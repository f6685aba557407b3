use super::{
    ScanRejection, SessionSnapshot, TransientNetworkError, ValidationFunction, ValidationRequest,
    ValidationResponse,
};
use crate::attendance_merger::AttendanceMerger;
use crate::error::AppError;
use crate::models::ScanClaim;
use crate::session_store::SessionStore;
use crate::token;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use db::models::attendance_session::Model as SessionRow;
use db::repositories::SessionRepository;
use ipnet::IpNet;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use util::clock::SharedClock;
use util::config::AppConfig;
use util::events::{Event, EventBus};

#[derive(Debug, Serialize)]
pub struct AttendanceRecorded {
    pub session_id: String,
    pub course_code: String,
    pub student_id: String,
    pub scanned_at: DateTime<Utc>,
    pub is_online: bool,
}

impl Event for AttendanceRecorded {
    const NAME: &'static str = "attendance.recorded";

    fn topic_path(&self) -> String {
        format!("courses/{}/sessions/{}", self.course_code, self.session_id)
    }
}

/// In-process authority for scan claims.
///
/// Live claims must carry the session's current key and arrive before the
/// end time. Offline replays must carry the key that was current at their
/// capture instant, captured inside `[start, end + grace]`.
pub struct AttendanceValidator {
    repo: SessionRepository,
    merger: Arc<AttendanceMerger>,
    clock: SharedClock,
    offline_grace: Duration,
    clock_skew: Duration,
    store: Option<Arc<SessionStore>>,
    events: Option<EventBus>,
}

impl AttendanceValidator {
    pub fn new(repo: SessionRepository, merger: Arc<AttendanceMerger>, clock: SharedClock) -> Self {
        let (grace, skew) = {
            let cfg = AppConfig::global();
            (cfg.offline_grace_minutes, cfg.clock_skew_secs)
        };
        Self {
            repo,
            merger,
            clock,
            offline_grace: Duration::minutes(grace),
            clock_skew: Duration::seconds(skew.max(0)),
            store: None,
            events: None,
        }
    }

    pub fn with_offline_grace(mut self, grace: Duration) -> Self {
        self.offline_grace = grace;
        self
    }

    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    /// Admit live scans only for the session the store holds as its
    /// course's current, unended session.
    pub fn with_session_store(mut self, store: Arc<SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn check(&self, request: &ValidationRequest) -> Result<ValidationResponse, AppError> {
        match self.admit(request).await? {
            Ok((row, claim)) => self.record(&row, claim).await,
            Err(reason) => {
                tracing::info!(
                    student = %request.claim.student_id,
                    online = request.claim.is_online,
                    reason = %reason,
                    "scan rejected"
                );
                Ok(ValidationResponse::rejected(reason))
            }
        }
    }

    /// The admission decision. The outer error is infrastructure failure,
    /// the inner one a rejection of the claim.
    async fn admit(
        &self,
        request: &ValidationRequest,
    ) -> Result<Result<(SessionRow, ScanClaim), ScanRejection>, AppError> {
        let now = self.clock.now();
        let payload = match token::decode(&request.token) {
            Ok(p) => p,
            Err(e) => return Ok(Err(ScanRejection::InvalidPayload(e.to_string()))),
        };
        if request.claim.student_id.trim().is_empty() {
            return Ok(Err(ScanRejection::InvalidPayload("missing student id".into())));
        }

        let Some(row) = self.repo.find_session_or_fallback(&payload.sid).await? else {
            return Ok(Err(ScanRejection::UnknownSession));
        };

        let claim = if request.claim.is_online {
            if !self.admits_live(&row, now).await {
                return Ok(Err(ScanRejection::ExpiredSession));
            }
            if payload.key != row.temporal_key {
                return Ok(Err(ScanRejection::StaleToken));
            }
            if !ip_permitted(row.restrict_by_ip, row.allowed_ip_cidr.as_deref(), request.client_ip) {
                return Ok(Err(ScanRejection::IpNotPermitted));
            }
            ScanClaim {
                scanned_at: now,
                ..request.claim.clone()
            }
        } else {
            let stamped = request.claim.scanned_at;
            if stamped > now + self.clock_skew {
                return Ok(Err(ScanRejection::InvalidPayload(
                    "capture time is in the future".into(),
                )));
            }
            // Device clocks within the skew tolerance are pulled onto the
            // server's timeline: never after now, never before the start.
            let captured_at = stamped.min(now);
            if captured_at + self.clock_skew < row.starts_at
                || captured_at > row.expires_at + self.offline_grace
            {
                return Ok(Err(ScanRejection::ExpiredSession));
            }
            let captured_at = captured_at.max(row.starts_at);
            match self.repo.key_at(&row.id, captured_at).await? {
                Some(key) if key == payload.key => {}
                _ => return Ok(Err(ScanRejection::StaleToken)),
            }
            ScanClaim {
                scanned_at: captured_at,
                ..request.claim.clone()
            }
        };

        if row.device_binding {
            if let Some(device) = &claim.device_id {
                if let Some(existing) = self.repo.record_for_device(&row.id, device).await? {
                    if existing.student_id != claim.student_id {
                        return Ok(Err(ScanRejection::DeviceMismatch));
                    }
                }
            }
        }

        Ok(Ok((row, claim)))
    }

    async fn admits_live(&self, row: &SessionRow, now: DateTime<Utc>) -> bool {
        match &self.store {
            Some(store) => {
                store.has_active_session(&row.course_code).await
                    && store
                        .get_current_session(&row.course_code)
                        .await
                        .is_some_and(|s| s.id == row.id)
            }
            None => !row.is_ended(now),
        }
    }

    async fn record(&self, row: &SessionRow, claim: ScanClaim) -> Result<ValidationResponse, AppError> {
        let outcomes = self.merger.apply(row, std::slice::from_ref(&claim)).await?;
        let snapshot = SessionSnapshot {
            id: row.id.clone(),
            course_code: row.course_code.clone(),
            course_name: row.course_name.clone(),
            starts_at: row.starts_at,
            ends_at: row.expires_at,
        };

        if outcomes.first().is_some_and(|o| o.was_already_scanned()) {
            return Ok(ValidationResponse::already_scanned(snapshot));
        }

        tracing::info!(
            session_id = %row.id,
            student = %claim.student_id,
            online = claim.is_online,
            "attendance recorded"
        );
        if let Some(events) = &self.events {
            events
                .emit(&AttendanceRecorded {
                    session_id: row.id.clone(),
                    course_code: row.course_code.clone(),
                    student_id: claim.student_id.clone(),
                    scanned_at: claim.scanned_at,
                    is_online: claim.is_online,
                })
                .await;
        }
        Ok(ValidationResponse::accepted(snapshot))
    }
}

#[async_trait]
impl ValidationFunction for AttendanceValidator {
    async fn validate(
        &self,
        request: ValidationRequest,
    ) -> Result<ValidationResponse, TransientNetworkError> {
        self.check(&request).await.map_err(|e| {
            tracing::error!(error = %e, "validation failed");
            TransientNetworkError::Server(e.to_string())
        })
    }
}

/// A session without IP restriction admits everyone. With restriction, the
/// client must be known and inside `allowed_cidr`; an unparsable CIDR admits
/// nobody.
pub fn ip_permitted(restrict: bool, allowed_cidr: Option<&str>, client: Option<IpAddr>) -> bool {
    if !restrict {
        return true;
    }
    let Some(ip) = client else {
        return false;
    };
    match allowed_cidr.map(str::parse::<IpNet>) {
        Some(Ok(net)) => net.contains(&ip),
        Some(Err(e)) => {
            tracing::warn!(cidr = ?allowed_cidr, error = %e, "invalid allowed_ip_cidr");
            false
        }
        None => false,
    }
}
