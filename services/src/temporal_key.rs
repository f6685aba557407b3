use crate::error::AppError;
use crate::session_store::SessionStore;
use crate::token;
use crate::validation::ScanRejection;
use db::repositories::SessionRepository;
use rand::RngCore;
use std::sync::Arc;
use util::clock::SharedClock;

pub const KEY_BYTES: usize = 32;

/// 32 random bytes, hex encoded.
pub fn generate_key() -> String {
    let mut bytes = [0u8; KEY_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Issues a session's rotating secret. The relational store is written first,
/// inside the transaction that closes the previous key epoch; the in-memory
/// copy and its cached token follow.
pub struct TemporalKeyRotator {
    repo: SessionRepository,
    store: Arc<SessionStore>,
    clock: SharedClock,
}

impl TemporalKeyRotator {
    pub fn new(repo: SessionRepository, store: Arc<SessionStore>, clock: SharedClock) -> Self {
        Self { repo, store, clock }
    }

    pub async fn rotate(&self, session_id: &str) -> Result<String, AppError> {
        let now = self.clock.now();
        let row = self
            .repo
            .find_session(session_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Session {session_id}")))?;
        if row.is_ended(now) {
            return Err(ScanRejection::ExpiredSession.into());
        }

        let key = generate_key();
        self.repo.rotate_key(session_id, &key, now).await?;

        match self.store.get_session(session_id).await {
            Some(mut cached) => {
                cached.temporal_key = key.clone();
                cached.encoded_token = Some(token::encode_for(&cached, now));
                self.store.update_active_session(cached).await?;
            }
            None => {
                tracing::warn!(session_id = %session_id, "rotated key for a session not held in the store");
            }
        }

        Ok(key)
    }
}
