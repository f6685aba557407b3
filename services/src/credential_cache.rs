//! Device-bound, signed and encrypted identity cache for offline
//! re-identification.
//!
//! Expired or tampered credentials are never returned; they are removed the
//! moment they are detected. The device fingerprint is stored separately and
//! outlives every credential.

use crate::crypto_vault::{self, CryptoError, HardwareSignals};
use crate::error::AppError;
use crate::local_cache::{LocalCache, LocalCacheExt};
use crate::models::{CredentialClaims, DeviceCredential, Identity};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use util::clock::SharedClock;

pub const CREDENTIAL_KEY: &str = "device_credential";
pub const FINGERPRINT_KEY: &str = "device_fingerprint";
const SIGNING_KEY_PREFIX: &[u8] = b"credential-signing:";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCredential {
    ciphertext: String,
    key: String,
    iv: String,
}

pub struct CredentialCache {
    cache: Arc<dyn LocalCache>,
    clock: SharedClock,
    signals: HardwareSignals,
}

fn signing_key(fingerprint: &str) -> [u8; 32] {
    let mut input = SIGNING_KEY_PREFIX.to_vec();
    input.extend_from_slice(fingerprint.as_bytes());
    crypto_vault::sha256(&input)
}

impl CredentialCache {
    pub fn new(cache: Arc<dyn LocalCache>, clock: SharedClock, signals: HardwareSignals) -> Self {
        Self {
            cache,
            clock,
            signals,
        }
    }

    /// The persisted fingerprint, derived and saved on first use.
    pub async fn device_fingerprint(&self) -> Result<String, AppError> {
        if let Some(fp) = self.cache.get::<String>(FINGERPRINT_KEY).await? {
            return Ok(fp);
        }
        let fp = crypto_vault::derive_device_fingerprint(&self.signals);
        self.cache.set(FINGERPRINT_KEY, &fp).await?;
        tracing::info!(fingerprint = %fp, "device fingerprint derived");
        Ok(fp)
    }

    /// Sign, encrypt and persist a credential valid for `ttl_hours`.
    /// Bad key or IV lengths propagate as [`CryptoError`].
    pub async fn store(
        &self,
        identity: Identity,
        key: &[u8],
        iv: &[u8],
        ttl_hours: i64,
        extra: BTreeMap<String, Value>,
    ) -> Result<DeviceCredential, AppError> {
        let fingerprint = self.device_fingerprint().await?;
        let issued_at = self.clock.now();
        let claims = CredentialClaims {
            user_id: identity.user_id,
            role: identity.role,
            role_identifier: identity.role_identifier,
            device_fingerprint: fingerprint.clone(),
            issued_at,
            expires_at: issued_at + Duration::hours(ttl_hours),
            extra,
        };
        let signature = crypto_vault::sign(&claims, &signing_key(&fingerprint))?;
        let credential = DeviceCredential { claims, signature };

        let plaintext = serde_json::to_vec(&credential)?;
        let ciphertext = crypto_vault::encrypt(&plaintext, key, iv)?;
        let stored = StoredCredential {
            ciphertext: B64.encode(ciphertext),
            key: B64.encode(key),
            iv: B64.encode(iv),
        };
        self.cache.set(CREDENTIAL_KEY, &stored).await?;

        tracing::info!(
            user_id = %credential.claims.user_id,
            expires_at = %credential.claims.expires_at,
            "credential cached"
        );
        Ok(credential)
    }

    /// True while an unexpired credential is stored. An expired one is
    /// deleted as a side effect.
    pub async fn is_valid(&self) -> bool {
        self.load_unexpired().await.is_some()
    }

    /// The credential, if unexpired and its signature still verifies against
    /// this device. Anything else clears the cache and yields `None`.
    pub async fn get(&self) -> Option<DeviceCredential> {
        let credential = self.load_unexpired().await?;

        let fingerprint = match self.device_fingerprint().await {
            Ok(fp) => fp,
            Err(e) => {
                tracing::warn!(error = %e, "device fingerprint unavailable");
                return None;
            }
        };

        let verified = credential.claims.device_fingerprint == fingerprint
            && crypto_vault::verify(
                &credential.claims,
                &credential.signature,
                &signing_key(&fingerprint),
            )
            .unwrap_or(false);

        if !verified {
            tracing::warn!(
                user_id = %credential.claims.user_id,
                "credential signature mismatch; treating device as signed out"
            );
            self.clear_quietly().await;
            return None;
        }
        Some(credential)
    }

    /// Remove the credential. The device fingerprint is kept.
    pub async fn clear(&self) -> Result<(), AppError> {
        self.cache.remove(CREDENTIAL_KEY).await
    }

    async fn clear_quietly(&self) {
        if let Err(e) = self.clear().await {
            tracing::error!(error = %e, "failed to clear credential");
        }
    }

    async fn load_unexpired(&self) -> Option<DeviceCredential> {
        let stored = match self.cache.get::<StoredCredential>(CREDENTIAL_KEY).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable credential blob; clearing");
                self.clear_quietly().await;
                return None;
            }
        };

        let credential = match decrypt_stored(&stored) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "credential cannot be trusted; clearing");
                self.clear_quietly().await;
                return None;
            }
        };

        if credential.claims.expires_at <= self.clock.now() {
            tracing::info!(user_id = %credential.claims.user_id, "credential expired; clearing");
            self.clear_quietly().await;
            return None;
        }
        Some(credential)
    }
}

fn decrypt_stored(stored: &StoredCredential) -> Result<DeviceCredential, AppError> {
    let b64 = |s: &str| {
        B64.decode(s)
            .map_err(|e| CryptoError::DecryptionFailed(format!("base64: {e}")))
    };
    let plaintext = crypto_vault::decrypt(&b64(&stored.ciphertext)?, &b64(&stored.key)?, &b64(&stored.iv)?)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_cache::SqlLocalCache;
    use crate::models::Role;
    use chrono::{TimeZone, Utc};
    use db::test_utils::setup_test_db;
    use util::clock::ManualClock;

    const KEY: [u8; 32] = [9u8; 32];
    const IV: [u8; 16] = [3u8; 16];

    fn signals() -> HardwareSignals {
        HardwareSignals {
            screen_width: 390,
            screen_height: 844,
            color_depth: 24,
            timezone: "Africa/Lagos".into(),
            platform: "android-aarch64".into(),
            cpu_cores: 8,
            font_probe: "000001".into(),
            gpu_renderer: "Adreno 650".into(),
            audio_sample_rate: 44_100,
        }
    }

    fn student() -> Identity {
        Identity {
            user_id: "user-1".into(),
            role: Role::Student,
            role_identifier: Some("21/52HA001".into()),
        }
    }

    async fn setup() -> (CredentialCache, Arc<dyn LocalCache>, ManualClock) {
        let cache: Arc<dyn LocalCache> = Arc::new(SqlLocalCache::new(setup_test_db().await));
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap());
        let creds = CredentialCache::new(cache.clone(), Arc::new(clock.clone()), signals());
        (creds, cache, clock)
    }

    #[tokio::test]
    async fn store_then_get() {
        let (creds, _, _) = setup().await;
        let mut extra = BTreeMap::new();
        extra.insert("department".to_string(), Value::from("CS"));

        let stored = creds.store(student(), &KEY, &IV, 12, extra).await.unwrap();
        assert!(creds.is_valid().await);

        let got = creds.get().await.unwrap();
        assert_eq!(got, stored);
        assert_eq!(got.student_id(), "21/52HA001");
        assert_eq!(got.claims.extra["department"], "CS");
    }

    #[tokio::test]
    async fn expired_credential_is_gone_after_read() {
        let (creds, cache, clock) = setup().await;
        creds.store(student(), &KEY, &IV, 12, BTreeMap::new()).await.unwrap();

        clock.advance(Duration::hours(13));
        assert!(creds.get().await.is_none());
        assert!(cache.get_raw(CREDENTIAL_KEY).await.unwrap().is_none());
        assert!(!creds.is_valid().await);
    }

    #[tokio::test]
    async fn is_valid_clears_expired_blob() {
        let (creds, cache, clock) = setup().await;
        creds.store(student(), &KEY, &IV, 1, BTreeMap::new()).await.unwrap();
        clock.advance(Duration::hours(1));
        assert!(!creds.is_valid().await);
        assert!(cache.get_raw(CREDENTIAL_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tampered_credential_is_cleared() {
        let (creds, cache, _) = setup().await;
        let mut cred = creds.store(student(), &KEY, &IV, 12, BTreeMap::new()).await.unwrap();

        cred.claims.role = Role::Admin;
        let ct = crypto_vault::encrypt(&serde_json::to_vec(&cred).unwrap(), &KEY, &IV).unwrap();
        let forged = StoredCredential {
            ciphertext: B64.encode(ct),
            key: B64.encode(KEY),
            iv: B64.encode(IV),
        };
        cache.set(CREDENTIAL_KEY, &forged).await.unwrap();

        assert!(creds.is_valid().await, "expiry alone does not check the signature");
        assert!(creds.get().await.is_none());
        assert!(cache.get_raw(CREDENTIAL_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn credential_from_another_device_is_rejected() {
        let (creds, cache, clock) = setup().await;
        creds.store(student(), &KEY, &IV, 12, BTreeMap::new()).await.unwrap();

        let mut other_signals = signals();
        other_signals.gpu_renderer = "Mali-G78".into();
        cache.remove(FINGERPRINT_KEY).await.unwrap();
        let other = CredentialCache::new(cache.clone(), Arc::new(clock), other_signals);

        assert!(other.get().await.is_none());
    }

    #[tokio::test]
    async fn fingerprint_survives_clear() {
        let (creds, _, _) = setup().await;
        let fp = creds.device_fingerprint().await.unwrap();
        creds.store(student(), &KEY, &IV, 12, BTreeMap::new()).await.unwrap();
        creds.clear().await.unwrap();
        assert!(creds.get().await.is_none());
        assert_eq!(creds.device_fingerprint().await.unwrap(), fp);
    }

    #[tokio::test]
    async fn bad_key_length_propagates() {
        let (creds, _, _) = setup().await;
        let err = creds.store(student(), &[0u8; 10], &IV, 12, BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, AppError::Crypto(CryptoError::InvalidKeyLength(10))));
    }
}
