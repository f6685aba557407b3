//! Locally persisted scans awaiting confirmation.
//!
//! The queue lives under one cache key; every read-modify-write runs inside
//! `lock`, which is never held across a network call.

use crate::crypto_vault;
use crate::error::AppError;
use crate::local_cache::{LocalCache, LocalCacheExt};
use crate::models::{OfflineQueuedScan, QueueStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use util::clock::SharedClock;
use uuid::Uuid;

pub const QUEUE_KEY: &str = "offline_scan_queue";

/// `sha256(raw_token || 0x1f || student_id)`, hex.
pub fn dedup_key(raw_token: &str, student_id: &str) -> String {
    let mut input = Vec::with_capacity(raw_token.len() + student_id.len() + 1);
    input.extend_from_slice(raw_token.as_bytes());
    input.push(0x1f);
    input.extend_from_slice(student_id.as_bytes());
    hex::encode(crypto_vault::sha256(&input))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued(OfflineQueuedScan),
    Duplicate(OfflineQueuedScan),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub failed: usize,
    pub expired: usize,
}

pub struct OfflineQueue {
    cache: Arc<dyn LocalCache>,
    clock: SharedClock,
    lock: Mutex<()>,
}

impl OfflineQueue {
    pub fn new(cache: Arc<dyn LocalCache>, clock: SharedClock) -> Self {
        Self {
            cache,
            clock,
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<OfflineQueuedScan>, AppError> {
        Ok(self.cache.get(QUEUE_KEY).await?.unwrap_or_default())
    }

    async fn save(&self, entries: &[OfflineQueuedScan]) -> Result<(), AppError> {
        self.cache.set(QUEUE_KEY, entries).await
    }

    /// Queue a scan unless one with the same dedup key is still pending.
    pub async fn enqueue(
        &self,
        raw_token: &str,
        student_id: &str,
        device_id: Option<&str>,
        captured_at: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, AppError> {
        let key = dedup_key(raw_token, student_id);
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;

        if let Some(existing) = entries
            .iter()
            .find(|e| e.dedup_key == key && e.status == QueueStatus::Pending)
        {
            return Ok(EnqueueOutcome::Duplicate(existing.clone()));
        }

        let entry = OfflineQueuedScan {
            id: Uuid::new_v4().to_string(),
            dedup_key: key,
            raw_token: raw_token.to_owned(),
            student_id: student_id.to_owned(),
            device_id: device_id.map(str::to_owned),
            captured_at,
            recorded_at: self.clock.now(),
            status: QueueStatus::Pending,
            attempts: 0,
            last_error: None,
        };
        entries.push(entry.clone());
        self.save(&entries).await?;
        Ok(EnqueueOutcome::Queued(entry))
    }

    pub async fn entries(&self) -> Result<Vec<OfflineQueuedScan>, AppError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    pub async fn pending(&self) -> Result<Vec<OfflineQueuedScan>, AppError> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.status == QueueStatus::Pending)
            .collect())
    }

    pub async fn counts(&self) -> Result<QueueCounts, AppError> {
        let mut counts = QueueCounts::default();
        for e in self.entries().await? {
            match e.status {
                QueueStatus::Pending => counts.pending += 1,
                QueueStatus::Failed => counts.failed += 1,
                QueueStatus::Expired => counts.expired += 1,
            }
        }
        Ok(counts)
    }

    /// Returns whether an entry was removed.
    pub async fn remove(&self, id: &str) -> Result<bool, AppError> {
        self.retain(|e| e.id != id).await.map(|n| n == 1)
    }

    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<(), AppError> {
        self.set_status(id, QueueStatus::Failed, Some(error)).await
    }

    pub async fn mark_expired(&self, id: &str) -> Result<(), AppError> {
        self.set_status(id, QueueStatus::Expired, None).await
    }

    /// Drop entries whose session was confirmed expired.
    pub async fn purge_expired(&self) -> Result<usize, AppError> {
        self.retain(|e| e.status != QueueStatus::Expired).await
    }

    pub async fn clear_failed(&self) -> Result<usize, AppError> {
        self.retain(|e| e.status != QueueStatus::Failed).await
    }

    async fn set_status(
        &self,
        id: &str,
        status: QueueStatus,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| AppError::not_found(format!("Queued scan {id}")))?;
        entry.status = status;
        entry.attempts += 1;
        if let Some(error) = error {
            entry.last_error = Some(error.to_owned());
        }
        self.save(&entries).await
    }

    /// Keep entries matching `keep`; returns how many were dropped.
    async fn retain<F>(&self, keep: F) -> Result<usize, AppError>
    where
        F: Fn(&OfflineQueuedScan) -> bool,
    {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        let before = entries.len();
        entries.retain(keep);
        let dropped = before - entries.len();
        if dropped > 0 {
            self.save(&entries).await?;
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_cache::SqlLocalCache;
    use chrono::TimeZone;
    use db::test_utils::setup_test_db;
    use util::clock::ManualClock;

    async fn queue() -> OfflineQueue {
        let cache: Arc<dyn LocalCache> = Arc::new(SqlLocalCache::new(setup_test_db().await));
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap());
        OfflineQueue::new(cache, Arc::new(clock))
    }

    #[test]
    fn dedup_key_separates_fields() {
        assert_ne!(dedup_key("ab", "c"), dedup_key("a", "bc"));
        assert_eq!(dedup_key("tok", "u1"), dedup_key("tok", "u1"));
        assert_eq!(dedup_key("tok", "u1").len(), 64);
    }

    #[tokio::test]
    async fn identical_scan_is_queued_once() {
        let q = queue().await;
        let at = Utc::now();
        let first = q.enqueue("tok", "u1", Some("dev"), at).await.unwrap();
        let EnqueueOutcome::Queued(entry) = first else {
            panic!("first scan should queue");
        };
        let second = q.enqueue("tok", "u1", Some("dev"), at).await.unwrap();
        assert_eq!(second, EnqueueOutcome::Duplicate(entry));
        assert_eq!(q.entries().await.unwrap().len(), 1);

        q.enqueue("tok", "u2", Some("dev"), at).await.unwrap();
        assert_eq!(q.entries().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_entries_leave_pending_and_can_be_cleared() {
        let q = queue().await;
        let EnqueueOutcome::Queued(a) = q.enqueue("t1", "u1", None, Utc::now()).await.unwrap() else {
            panic!()
        };
        q.enqueue("t2", "u1", None, Utc::now()).await.unwrap();

        q.mark_failed(&a.id, "stale token").await.unwrap();
        let failed = q.entries().await.unwrap().into_iter().find(|e| e.id == a.id).unwrap();
        assert_eq!(failed.status, QueueStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.last_error.as_deref(), Some("stale token"));

        assert_eq!(q.pending().await.unwrap().len(), 1);
        assert_eq!(q.counts().await.unwrap(), QueueCounts { pending: 1, failed: 1, expired: 0 });
        assert_eq!(q.clear_failed().await.unwrap(), 1);
        assert_eq!(q.entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rescan_after_failure_queues_again() {
        let q = queue().await;
        let EnqueueOutcome::Queued(a) = q.enqueue("t1", "u1", None, Utc::now()).await.unwrap() else {
            panic!()
        };
        q.mark_failed(&a.id, "server refused").await.unwrap();

        let again = q.enqueue("t1", "u1", None, Utc::now()).await.unwrap();
        let EnqueueOutcome::Queued(b) = again else {
            panic!("rescan of a failed entry should queue")
        };
        assert_ne!(a.id, b.id);
        assert_eq!(q.counts().await.unwrap(), QueueCounts { pending: 1, failed: 1, expired: 0 });
    }

    #[tokio::test]
    async fn expired_entries_are_purged() {
        let q = queue().await;
        let EnqueueOutcome::Queued(a) = q.enqueue("t1", "u1", None, Utc::now()).await.unwrap() else {
            panic!()
        };
        q.mark_expired(&a.id).await.unwrap();
        assert_eq!(q.purge_expired().await.unwrap(), 1);
        assert!(q.entries().await.unwrap().is_empty());
        assert!(!q.remove(&a.id).await.unwrap());
    }
}
