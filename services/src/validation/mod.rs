//! The authoritative accept/reject decision for a scan claim, and the
//! contract both the in-process validator and the HTTP client implement.

mod http_client;
mod validator;

pub use http_client::HttpValidationClient;
pub use validator::{AttendanceRecorded, AttendanceValidator, ip_permitted};

use crate::models::ScanClaim;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Wire-level reason code carried in a [`ValidationResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    AlreadyScanned,
    SessionExpired,
    StaleToken,
    UnknownSession,
    InvalidPayload,
    DeviceMismatch,
    IpNotPermitted,
}

/// Permanent, user-facing rejections. None of these is ever retried.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail")]
pub enum ScanRejection {
    #[error("token key no longer matches the session")]
    StaleToken,
    #[error("session is unknown")]
    UnknownSession,
    #[error("session has ended")]
    ExpiredSession,
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("device already recorded a different student")]
    DeviceMismatch,
    #[error("client address is not permitted for this session")]
    IpNotPermitted,
}

impl ScanRejection {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::StaleToken => ErrorCode::StaleToken,
            Self::UnknownSession => ErrorCode::UnknownSession,
            Self::ExpiredSession => ErrorCode::SessionExpired,
            Self::InvalidPayload(_) => ErrorCode::InvalidPayload,
            Self::DeviceMismatch => ErrorCode::DeviceMismatch,
            Self::IpNotPermitted => ErrorCode::IpNotPermitted,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::StaleToken => "Code has changed, please rescan",
            Self::UnknownSession => "Invalid code",
            Self::ExpiredSession => "Session closed",
            Self::InvalidPayload(_) => "Invalid code",
            Self::DeviceMismatch => "This device already signed in another student",
            Self::IpNotPermitted => "Not on the permitted network",
        }
    }
}

/// Transient failures. They trigger the offline fallback on capture and are
/// left for the next cycle by the reconciler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransientNetworkError {
    #[error("request timed out")]
    Timeout,
    #[error("network unreachable: {0}")]
    Unreachable(String),
    #[error("server error: {0}")]
    Server(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub token: String,
    pub claim: ScanClaim,
    /// Filled in by the receiving server from the connection, never trusted from the body.
    #[serde(skip)]
    pub client_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub course_code: String,
    pub course_name: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResponse {
    pub success: bool,
    pub message: String,
    pub error_code: Option<ErrorCode>,
    #[serde(default)]
    pub rejection: Option<ScanRejection>,
    pub session: Option<SessionSnapshot>,
}

impl ValidationResponse {
    pub fn accepted(session: SessionSnapshot) -> Self {
        Self {
            success: true,
            message: "Attendance recorded".into(),
            error_code: None,
            rejection: None,
            session: Some(session),
        }
    }

    pub fn already_scanned(session: SessionSnapshot) -> Self {
        Self {
            success: true,
            message: "Attendance already recorded".into(),
            error_code: Some(ErrorCode::AlreadyScanned),
            rejection: None,
            session: Some(session),
        }
    }

    pub fn rejected(reason: ScanRejection) -> Self {
        Self {
            success: false,
            message: reason.to_string(),
            error_code: Some(reason.code()),
            rejection: Some(reason),
            session: None,
        }
    }

    pub fn outcome(&self) -> ValidationOutcome {
        if self.error_code == Some(ErrorCode::AlreadyScanned) {
            return ValidationOutcome::AlreadyScanned;
        }
        if self.success {
            return ValidationOutcome::Accepted;
        }
        let reason = self.rejection.clone().unwrap_or_else(|| match self.error_code {
            Some(ErrorCode::SessionExpired) => ScanRejection::ExpiredSession,
            Some(ErrorCode::StaleToken) => ScanRejection::StaleToken,
            Some(ErrorCode::UnknownSession) => ScanRejection::UnknownSession,
            Some(ErrorCode::DeviceMismatch) => ScanRejection::DeviceMismatch,
            Some(ErrorCode::IpNotPermitted) => ScanRejection::IpNotPermitted,
            _ => ScanRejection::InvalidPayload(self.message.clone()),
        });
        ValidationOutcome::Rejected(reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Accepted,
    AlreadyScanned,
    Rejected(ScanRejection),
}

#[async_trait]
pub trait ValidationFunction: Send + Sync {
    async fn validate(
        &self,
        request: ValidationRequest,
    ) -> Result<ValidationResponse, TransientNetworkError>;
}

/// One call with a bounded timeout and at most one retry.
pub async fn validate_with_budget(
    validator: &dyn ValidationFunction,
    request: ValidationRequest,
    timeout: Duration,
) -> Result<ValidationResponse, TransientNetworkError> {
    let mut last = TransientNetworkError::Timeout;
    for attempt in 0..2 {
        match tokio::time::timeout(timeout, validator.validate(request.clone())).await {
            Ok(Ok(resp)) => return Ok(resp),
            Ok(Err(e)) => last = e,
            Err(_) => last = TransientNetworkError::Timeout,
        }
        tracing::debug!(attempt, error = %last, "validation attempt failed");
    }
    Err(last)
}
