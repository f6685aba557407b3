//! Replays the offline queue against the validation function.

use crate::error::AppError;
use crate::models::{OfflineQueuedScan, ScanClaim};
use crate::offline_queue::{OfflineQueue, QueueCounts};
use crate::validation::{
    ScanRejection, TransientNetworkError, ValidationFunction, ValidationOutcome, ValidationRequest,
    validate_with_budget,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use util::clock::SharedClock;
use util::config::AppConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    #[serde(flatten)]
    pub counts: QueueCounts,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub in_flight: bool,
}

/// What a single replay did to its queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryFate {
    Removed,
    Expired,
    Failed,
    /// The server could not judge this entry; it stays pending and the
    /// cycle moves on.
    Deferred,
    /// Timeout or no route to the server; the entry stays pending and the
    /// cycle stops.
    Interrupted,
}

/// Resets the in-flight flag even if the sync future is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncReconciler {
    validator: Arc<dyn ValidationFunction>,
    queue: Arc<OfflineQueue>,
    clock: SharedClock,
    timeout: Duration,
    in_flight: AtomicBool,
    last_sync_at: RwLock<Option<DateTime<Utc>>>,
}

impl SyncReconciler {
    pub fn new(
        validator: Arc<dyn ValidationFunction>,
        queue: Arc<OfflineQueue>,
        clock: SharedClock,
    ) -> Self {
        let timeout = Duration::from_secs(AppConfig::global().network_timeout_secs);
        Self {
            validator,
            queue,
            clock,
            timeout,
            in_flight: AtomicBool::new(false),
            last_sync_at: RwLock::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Replay every pending entry once. Returns true iff nothing is left
    /// pending afterwards. A call made while another is running returns
    /// false immediately.
    pub async fn try_sync_all(&self) -> bool {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("sync already in flight");
            return false;
        }
        let _guard = InFlight(&self.in_flight);

        match self.run_cycle().await {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(error = %e, "offline sync failed");
                false
            }
        }
    }

    pub async fn status(&self) -> Result<SyncStatus, AppError> {
        Ok(SyncStatus {
            counts: self.queue.counts().await?,
            last_sync_at: *self.last_sync_at.read().await,
            in_flight: self.is_syncing(),
        })
    }

    /// Drop entries that were permanently rejected.
    pub async fn clear_failed(&self) -> Result<usize, AppError> {
        let cleared = self.queue.clear_failed().await?;
        if cleared > 0 {
            tracing::info!(cleared, "failed offline scans cleared");
        }
        Ok(cleared)
    }

    async fn run_cycle(&self) -> Result<bool, AppError> {
        let pending = self.queue.pending().await?;
        let total = pending.len();
        let mut removed = 0usize;
        let mut failed = 0usize;
        let mut deferred = 0usize;
        let mut interrupted = false;

        for entry in pending {
            match self.replay(&entry).await? {
                EntryFate::Removed | EntryFate::Expired => removed += 1,
                EntryFate::Failed => failed += 1,
                EntryFate::Deferred => deferred += 1,
                EntryFate::Interrupted => {
                    interrupted = true;
                    break;
                }
            }
        }

        self.queue.purge_expired().await?;
        *self.last_sync_at.write().await = Some(self.clock.now());

        let remaining = self.queue.pending().await?.len();
        if total > 0 {
            tracing::info!(total, removed, failed, deferred, remaining, interrupted, "offline sync cycle finished");
        }
        Ok(remaining == 0)
    }

    async fn replay(&self, entry: &OfflineQueuedScan) -> Result<EntryFate, AppError> {
        let request = ValidationRequest {
            token: entry.raw_token.clone(),
            claim: ScanClaim {
                student_id: entry.student_id.clone(),
                scanned_at: entry.captured_at,
                is_online: false,
                device_id: entry.device_id.clone(),
            },
            client_ip: None,
        };

        let response =
            match validate_with_budget(self.validator.as_ref(), request, self.timeout).await {
                Ok(r) => r,
                Err(TransientNetworkError::Server(e)) => {
                    tracing::warn!(queue_id = %entry.id, error = %e, "replay deferred");
                    return Ok(EntryFate::Deferred);
                }
                Err(e) => {
                    tracing::warn!(queue_id = %entry.id, error = %e, "server unreachable; sync interrupted");
                    return Ok(EntryFate::Interrupted);
                }
            };

        match response.outcome() {
            ValidationOutcome::Accepted | ValidationOutcome::AlreadyScanned => {
                self.queue.remove(&entry.id).await?;
                Ok(EntryFate::Removed)
            }
            ValidationOutcome::Rejected(ScanRejection::ExpiredSession) => {
                tracing::warn!(
                    queue_id = %entry.id,
                    student = %entry.student_id,
                    captured_at = %entry.captured_at,
                    "offline scan discarded: session expired"
                );
                self.queue.mark_expired(&entry.id).await?;
                Ok(EntryFate::Expired)
            }
            ValidationOutcome::Rejected(reason) => {
                tracing::warn!(queue_id = %entry.id, reason = %reason, "offline scan rejected");
                self.queue.mark_failed(&entry.id, &reason.to_string()).await?;
                Ok(EntryFate::Failed)
            }
        }
    }
}
