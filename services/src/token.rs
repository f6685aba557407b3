//! Scannable session token: `base64url(JSON{v, sid, course, key, iat})`.
//!
//! The capture path only needs the session id and key out of it; the rest is
//! carried for display and diagnostics.

use crate::models::AttendanceSession;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

pub const TOKEN_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub v: u8,
    pub sid: String,
    pub course: String,
    pub key: String,
    pub iat: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is not valid base64url")]
    Encoding,
    #[error("token body is malformed: {0}")]
    Malformed(String),
    #[error("unsupported token version {0}")]
    UnsupportedVersion(u8),
}

pub fn encode(sid: &str, course: &str, key: &str, issued_at: DateTime<Utc>) -> String {
    let body = json!({
        "v": TOKEN_VERSION,
        "sid": sid,
        "course": course,
        "key": key,
        "iat": issued_at.timestamp(),
    });
    URL_SAFE_NO_PAD.encode(body.to_string())
}

pub fn encode_for(session: &AttendanceSession, issued_at: DateTime<Utc>) -> String {
    encode(
        &session.id,
        &session.course_code,
        &session.temporal_key,
        issued_at,
    )
}

pub fn decode(raw: &str) -> Result<TokenPayload, TokenError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(raw.trim().trim_end_matches('='))
        .map_err(|_| TokenError::Encoding)?;
    let payload: TokenPayload =
        serde_json::from_slice(&bytes).map_err(|e| TokenError::Malformed(e.to_string()))?;
    if payload.v != TOKEN_VERSION {
        return Err(TokenError::UnsupportedVersion(payload.v));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn decode_reads_what_encode_wrote() {
        let at = Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap();
        let raw = encode("s1", "COS301", "ab12", at);
        assert!(!raw.contains('='));
        let p = decode(&raw).unwrap();
        assert_eq!(p.sid, "s1");
        assert_eq!(p.key, "ab12");
        assert_eq!(p.iat, at.timestamp());
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(decode("%%%").unwrap_err(), TokenError::Encoding);
        let not_json = URL_SAFE_NO_PAD.encode("hello");
        assert!(matches!(decode(&not_json), Err(TokenError::Malformed(_))));
    }

    #[test]
    fn future_version_is_rejected() {
        let raw = URL_SAFE_NO_PAD
            .encode(r#"{"v":9,"sid":"s","course":"c","key":"k","iat":0}"#);
        assert_eq!(decode(&raw).unwrap_err(), TokenError::UnsupportedVersion(9));
    }
}
