//! Domain types shared by the capture path, the reconciler and the session
//! lifecycle. Storage rows live in `db::models`; these are the values the
//! services pass around and persist as JSON.

use crate::validation::ScanRejection;
use chrono::{DateTime, Utc};
use db::models::attendance_session::Model as SessionRow;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMeta {
    pub theme: Option<String>,
    pub venue: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFeatures {
    pub restrict_by_ip: bool,
    pub allowed_ip_cidr: Option<String>,
    pub device_binding: bool,
}

/// One course's live attendance window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceSession {
    pub id: String,
    pub course_code: String,
    pub course_name: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub duration_minutes: i64,
    #[serde(default)]
    pub display: DisplayMeta,
    pub temporal_key: String,
    #[serde(default)]
    pub security: SecurityFeatures,
    /// Cached scannable token for the current key.
    pub encoded_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AttendanceSession {
    pub fn from_row(row: SessionRow, display: DisplayMeta) -> Self {
        Self {
            id: row.id,
            course_code: row.course_code,
            course_name: row.course_name,
            starts_at: row.starts_at,
            ends_at: row.expires_at,
            duration_minutes: row.duration_minutes,
            display,
            temporal_key: row.temporal_key,
            security: SecurityFeatures {
                restrict_by_ip: row.restrict_by_ip,
                allowed_ip_cidr: row.allowed_ip_cidr,
                device_binding: row.device_binding,
            },
            encoded_token: None,
            created_at: row.created_at,
        }
    }

    pub fn to_row(&self, updated_at: DateTime<Utc>) -> SessionRow {
        SessionRow {
            id: self.id.clone(),
            course_code: self.course_code.clone(),
            course_name: self.course_name.clone(),
            temporal_key: self.temporal_key.clone(),
            starts_at: self.starts_at,
            expires_at: self.ends_at,
            duration_minutes: self.duration_minutes,
            restrict_by_ip: self.security.restrict_by_ip,
            allowed_ip_cidr: self.security.allowed_ip_cidr.clone(),
            device_binding: self.security.device_binding,
            created_at: self.created_at,
            updated_at,
        }
    }

    /// Terminal once `now` reaches the end time.
    pub fn is_ended(&self, now: DateTime<Utc>) -> bool {
        now >= self.ends_at
    }
}

/// The uniform input to the merger: live scans, replayed offline scans and
/// manual sign-ins all take this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanClaim {
    pub student_id: String,
    pub scanned_at: DateTime<Utc>,
    pub is_online: bool,
    pub device_id: Option<String>,
}

/// One student's presence in one session, as held in the course document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub student_id: String,
    pub scanned_at: DateTime<Utc>,
    pub has_scanned: bool,
    pub is_online_scan: bool,
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub academic_level: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Failed,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineQueuedScan {
    pub id: String,
    pub dedup_key: String,
    pub raw_token: String,
    pub student_id: String,
    pub device_id: Option<String>,
    pub captured_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub status: QueueStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Lecturer,
    Admin,
}

/// Who the device owner is, as established at sign-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
    /// Lecturer id or matric number.
    pub role_identifier: Option<String>,
}

/// The signed portion of a cached credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialClaims {
    pub user_id: String,
    pub role: Role,
    pub role_identifier: Option<String>,
    pub device_fingerprint: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCredential {
    #[serde(flatten)]
    pub claims: CredentialClaims,
    pub signature: String,
}

impl DeviceCredential {
    pub fn identity(&self) -> Identity {
        Identity {
            user_id: self.claims.user_id.clone(),
            role: self.claims.role,
            role_identifier: self.claims.role_identifier.clone(),
        }
    }

    /// The id a scan is attributed to: matric number when known, else user id.
    pub fn student_id(&self) -> &str {
        self.claims
            .role_identifier
            .as_deref()
            .unwrap_or(&self.claims.user_id)
    }
}

/// What a single scan attempt produced, from the scanner's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttendanceResult {
    Recorded {
        session_id: String,
        scanned_at: DateTime<Utc>,
    },
    AlreadyScanned {
        session_id: String,
    },
    Rejected {
        reason: ScanRejection,
    },
    RecordedOffline {
        queue_id: String,
    },
    Duplicate {
        queue_id: String,
    },
}

impl AttendanceResult {
    /// Text shown to the person holding the scanner.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Recorded { .. } => "Attendance recorded",
            Self::AlreadyScanned { .. } => "Attendance already recorded",
            Self::Rejected { reason } => reason.user_message(),
            Self::RecordedOffline { .. } => "Saved offline, will sync when connected",
            Self::Duplicate { .. } => "This scan is already waiting to sync",
        }
    }
}
