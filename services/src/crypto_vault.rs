//! Symmetric encryption, HMAC signing and device fingerprinting.
//!
//! Every failure here is a [`CryptoError`]. Callers treat any error as "cannot
//! be trusted" and never retry with weaker parameters.

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::str::FromStr;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const IV_LEN: usize = 16;
pub const FINGERPRINT_VERSION: &str = "fp1";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key length: expected 16, 24 or 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid IV length: expected 16 bytes, got {0}")]
    InvalidIvLength(usize),

    #[error("HMAC key must not be empty")]
    EmptyKey,

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

fn check_iv(iv: &[u8]) -> Result<(), CryptoError> {
    if iv.len() != IV_LEN {
        return Err(CryptoError::InvalidIvLength(iv.len()));
    }
    Ok(())
}

/// AES-CBC with PKCS#7 padding. The cipher width follows the key length.
pub fn encrypt(plaintext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_iv(iv)?;
    let bad_key = |_| CryptoError::InvalidKeyLength(key.len());
    let out = match key.len() {
        16 => cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        24 => cbc::Encryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        32 => cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        n => return Err(CryptoError::InvalidKeyLength(n)),
    };
    Ok(out)
}

pub fn decrypt(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_iv(iv)?;
    let bad_key = |_| CryptoError::InvalidKeyLength(key.len());
    let unpad = |e: cbc::cipher::block_padding::UnpadError| {
        CryptoError::DecryptionFailed(e.to_string())
    };
    match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(unpad),
        24 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(unpad),
        32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(unpad),
        n => Err(CryptoError::InvalidKeyLength(n)),
    }
}

/// Compact JSON with object keys sorted at every depth.
pub fn canonical_json<T: Serialize + ?Sized>(data: &T) -> Result<String, CryptoError> {
    let value =
        serde_json::to_value(data).map_err(|e| CryptoError::Serialization(e.to_string()))?;
    let mut out = String::new();
    write_canonical(&value, &mut out);
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn mac_for(key: &[u8]) -> Result<HmacSha256, CryptoError> {
    if key.is_empty() {
        return Err(CryptoError::EmptyKey);
    }
    HmacSha256::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))
}

/// HMAC-SHA256 over the canonical JSON of `data`, as lowercase hex.
pub fn sign<T: Serialize + ?Sized>(data: &T, key: &[u8]) -> Result<String, CryptoError> {
    let mut mac = mac_for(key)?;
    mac.update(canonical_json(data)?.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of `tag` against `data`. A malformed tag is a mismatch.
pub fn verify<T: Serialize + ?Sized>(data: &T, tag: &str, key: &[u8]) -> Result<bool, CryptoError> {
    let mut mac = mac_for(key)?;
    mac.update(canonical_json(data)?.as_bytes());
    let Ok(expected) = hex::decode(tag) else {
        return Ok(false);
    };
    Ok(mac.verify_slice(&expected).is_ok())
}

pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Slow-changing host signals that together identify a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HardwareSignals {
    pub screen_width: u32,
    pub screen_height: u32,
    pub color_depth: u8,
    pub timezone: String,
    pub platform: String,
    pub cpu_cores: u32,
    pub font_probe: String,
    pub gpu_renderer: String,
    pub audio_sample_rate: u32,
}

const FONT_DIRS: [&str; 6] = [
    "/usr/share/fonts",
    "/usr/local/share/fonts",
    "/System/Library/Fonts",
    "/Library/Fonts",
    "C:\\Windows\\Fonts",
    "/system/fonts",
];

impl HardwareSignals {
    /// Gather what the host exposes. Signals with no source on this host
    /// (a headless server has no display) fall back to fixed placeholders so
    /// the result stays deterministic.
    pub fn collect() -> Self {
        Self::collect_with(|key| std::env::var(key).ok())
    }

    /// `collect` over an arbitrary variable source. Values that do not parse
    /// into their field's type, including out-of-range numbers, read as 0.
    fn collect_with(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn num<T: FromStr + Default>(raw: Option<String>) -> T {
            raw.and_then(|v| v.trim().parse().ok()).unwrap_or_default()
        }
        let text_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let font_probe = FONT_DIRS
            .iter()
            .map(|dir| {
                if std::path::Path::new(dir).is_dir() {
                    '1'
                } else {
                    '0'
                }
            })
            .collect();

        Self {
            screen_width: num(lookup("DEVICE_SCREEN_WIDTH")),
            screen_height: num(lookup("DEVICE_SCREEN_HEIGHT")),
            color_depth: num(lookup("DEVICE_COLOR_DEPTH")),
            timezone: text_or("TZ", "UTC"),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            cpu_cores: std::thread::available_parallelism()
                .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
                .unwrap_or(1),
            font_probe,
            gpu_renderer: text_or("DEVICE_GPU_RENDERER", "unknown"),
            audio_sample_rate: num(lookup("DEVICE_AUDIO_SAMPLE_RATE")),
        }
    }

    /// Fixed-order tuple; fields are separated by the ASCII unit separator.
    fn canonical_tuple(&self) -> String {
        [
            format!("{}x{}", self.screen_width, self.screen_height),
            self.color_depth.to_string(),
            self.timezone.clone(),
            self.platform.clone(),
            self.cpu_cores.to_string(),
            self.font_probe.clone(),
            self.gpu_renderer.clone(),
            self.audio_sample_rate.to_string(),
        ]
        .join("\u{1f}")
    }
}

/// `fp1-<32 hex>`: the first 16 bytes of SHA-256 over the canonical tuple.
pub fn derive_device_fingerprint(signals: &HardwareSignals) -> String {
    let digest = sha256(signals.canonical_tuple().as_bytes());
    format!("{FINGERPRINT_VERSION}-{}", hex::encode(&digest[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const IV: [u8; 16] = [7u8; 16];

    fn signals() -> HardwareSignals {
        HardwareSignals {
            screen_width: 1920,
            screen_height: 1080,
            color_depth: 24,
            timezone: "Africa/Johannesburg".into(),
            platform: "linux-x86_64".into(),
            cpu_cores: 8,
            font_probe: "100000".into(),
            gpu_renderer: "Mesa Intel(R) UHD".into(),
            audio_sample_rate: 48_000,
        }
    }

    #[test]
    fn round_trips_for_every_key_size() {
        let msg = b"attendance payload that spans more than one block";
        for len in [16usize, 24, 32] {
            let key = vec![0x42u8; len];
            let ct = encrypt(msg, &key, &IV).unwrap();
            assert_ne!(ct.as_slice(), msg.as_slice());
            assert_eq!(ct.len() % 16, 0);
            assert_eq!(decrypt(&ct, &key, &IV).unwrap(), msg);
        }
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let key = [1u8; 16];
        let ct = encrypt(b"", &key, &IV).unwrap();
        assert_eq!(ct.len(), 16);
        assert!(decrypt(&ct, &key, &IV).unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_key_and_iv_lengths() {
        assert_eq!(
            encrypt(b"x", &[0u8; 20], &IV).unwrap_err(),
            CryptoError::InvalidKeyLength(20)
        );
        assert_eq!(
            encrypt(b"x", &[0u8; 16], &[0u8; 8]).unwrap_err(),
            CryptoError::InvalidIvLength(8)
        );
        assert_eq!(
            decrypt(&[0u8; 16], &[0u8; 31], &IV).unwrap_err(),
            CryptoError::InvalidKeyLength(31)
        );
    }

    #[test]
    fn wrong_key_fails_or_differs() {
        let ct = encrypt(b"secret identity", &[1u8; 32], &IV).unwrap();
        match decrypt(&ct, &[2u8; 32], &IV) {
            Err(CryptoError::DecryptionFailed(_)) => {}
            Ok(pt) => assert_ne!(pt, b"secret identity"),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let v = json!({"b": 1, "a": {"z": [3, {"y": 2, "x": 1}], "c": "s"}});
        assert_eq!(
            canonical_json(&v).unwrap(),
            r#"{"a":{"c":"s","z":[3,{"x":1,"y":2}]},"b":1}"#
        );
    }

    #[test]
    fn sign_then_verify() {
        let data = json!({"user": "u1", "role": "student"});
        let tag = sign(&data, b"k").unwrap();
        assert_eq!(tag.len(), 64);
        assert!(verify(&data, &tag, b"k").unwrap());
        assert!(!verify(&data, &tag, b"other").unwrap());
        assert!(!verify(&json!({"user": "u2", "role": "student"}), &tag, b"k").unwrap());
        assert!(!verify(&data, "not-hex", b"k").unwrap());
    }

    #[test]
    fn signature_ignores_key_order() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(sign(&a, b"k").unwrap(), sign(&b, b"k").unwrap());
    }

    #[test]
    fn empty_hmac_key_is_an_error() {
        assert_eq!(sign(&json!({}), b"").unwrap_err(), CryptoError::EmptyKey);
    }

    #[test]
    fn fingerprint_is_stable_and_versioned() {
        let fp = derive_device_fingerprint(&signals());
        assert_eq!(fp, derive_device_fingerprint(&signals()));
        assert!(fp.starts_with("fp1-"));
        assert_eq!(fp.len(), 4 + 32);

        let mut other = signals();
        other.cpu_cores = 4;
        assert_ne!(fp, derive_device_fingerprint(&other));
    }

    #[test]
    fn out_of_range_signals_read_as_zero() {
        let vars = |depth: &'static str| {
            move |key: &str| match key {
                "DEVICE_COLOR_DEPTH" => Some(depth.to_string()),
                "DEVICE_SCREEN_WIDTH" => Some(" 1280 ".to_string()),
                _ => None,
            }
        };
        let ok = HardwareSignals::collect_with(vars("24"));
        assert_eq!(ok.color_depth, 24);
        assert_eq!(ok.screen_width, 1280);
        assert_eq!(ok.timezone, "UTC");

        // 300 would wrap to 44 under a plain cast.
        assert_eq!(HardwareSignals::collect_with(vars("300")).color_depth, 0);
    }

    #[test]
    fn collect_is_deterministic_on_one_host() {
        assert_eq!(HardwareSignals::collect(), HardwareSignals::collect());
    }
}
