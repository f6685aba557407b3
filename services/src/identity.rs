//! Student profile resolution with an explicit degraded mode.
//!
//! When no authoritative profile exists the academic level is inferred from
//! the matric number's two-digit admission year. Callers can always tell the
//! two apart through [`ResolvedProfile`].

use crate::error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Month (1-based) in which a new academic year starts.
pub const ACADEMIC_YEAR_START_MONTH: u32 = 9;
const MAX_LEVEL: u16 = 600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentProfile {
    pub matric_number: String,
    pub full_name: Option<String>,
    pub level: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ResolvedProfile {
    Authoritative(StudentProfile),
    Inferred {
        matric_number: String,
        level: Option<u16>,
    },
}

impl ResolvedProfile {
    pub fn level(&self) -> Option<u16> {
        match self {
            Self::Authoritative(p) => Some(p.level),
            Self::Inferred { level, .. } => *level,
        }
    }

    pub fn is_authoritative(&self) -> bool {
        matches!(self, Self::Authoritative(_))
    }
}

#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn lookup(&self, matric_number: &str) -> Result<Option<StudentProfile>, AppError>;
}

/// No authoritative profiles; every resolution is inferred.
pub struct NoProfiles;

#[async_trait]
impl ProfileSource for NoProfiles {
    async fn lookup(&self, _matric_number: &str) -> Result<Option<StudentProfile>, AppError> {
        Ok(None)
    }
}

#[derive(Default)]
pub struct StaticProfiles {
    profiles: HashMap<String, StudentProfile>,
}

impl StaticProfiles {
    pub fn new(profiles: impl IntoIterator<Item = StudentProfile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|p| (p.matric_number.clone(), p))
                .collect(),
        }
    }
}

#[async_trait]
impl ProfileSource for StaticProfiles {
    async fn lookup(&self, matric_number: &str) -> Result<Option<StudentProfile>, AppError> {
        Ok(self.profiles.get(matric_number).cloned())
    }
}

pub async fn resolve_profile(
    source: &dyn ProfileSource,
    matric_number: &str,
    now: DateTime<Utc>,
) -> ResolvedProfile {
    match source.lookup(matric_number).await {
        Ok(Some(profile)) => return ResolvedProfile::Authoritative(profile),
        Ok(None) => {}
        Err(e) => tracing::warn!(matric = matric_number, error = %e, "profile lookup failed"),
    }

    let level = infer_level(matric_number, now);
    tracing::warn!(
        matric = matric_number,
        ?level,
        "no authoritative profile; academic level inferred from matric number (unverified)"
    );
    ResolvedProfile::Inferred {
        matric_number: matric_number.to_owned(),
        level,
    }
}

/// Level from the admission-year prefix, e.g. `19/52HA001` admitted in 2019.
/// Leading letters (`u21000001`) are skipped.
pub fn infer_level(matric_number: &str, now: DateTime<Utc>) -> Option<u16> {
    let digits: Vec<u32> = matric_number
        .trim_start_matches(|c: char| c.is_ascii_alphabetic())
        .chars()
        .take(2)
        .map(|c| c.to_digit(10))
        .collect::<Option<Vec<_>>>()?;
    if digits.len() != 2 {
        return None;
    }
    let admitted = 2000 + (digits[0] * 10 + digits[1]) as i32;

    let academic_year = if now.month() >= ACADEMIC_YEAR_START_MONTH {
        now.year()
    } else {
        now.year() - 1
    };
    let years = academic_year - admitted + 1;
    if years < 1 {
        return None;
    }
    let level = u16::try_from(years * 100).ok()?;
    (level <= MAX_LEVEL).then_some(level)
}
