//! Suspicion flags raised by the classifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Why an identity was flagged.
///
/// The declaration order doubles as the display order of reason labels in
/// auto-block messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspicionReason {
    HighVolume,
    SensitivePaths,
    FailedLogins,
    AdminAccess,
    BruteForce,
}

impl SuspicionReason {
    pub const ALL: [SuspicionReason; 5] = [
        SuspicionReason::HighVolume,
        SuspicionReason::SensitivePaths,
        SuspicionReason::FailedLogins,
        SuspicionReason::AdminAccess,
        SuspicionReason::BruteForce,
    ];

    /// Stable machine name, as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            SuspicionReason::HighVolume => "high_volume",
            SuspicionReason::SensitivePaths => "sensitive_paths",
            SuspicionReason::FailedLogins => "failed_logins",
            SuspicionReason::AdminAccess => "admin_access",
            SuspicionReason::BruteForce => "brute_force",
        }
    }

    /// Human-readable label used in block reasons.
    pub fn label(&self) -> &'static str {
        match self {
            SuspicionReason::HighVolume => "High request volume",
            SuspicionReason::SensitivePaths => "Sensitive path access",
            SuspicionReason::FailedLogins => "Multiple failed login attempts",
            SuspicionReason::AdminAccess => "Admin panel access attempts",
            SuspicionReason::BruteForce => "Brute force pattern",
        }
    }
}

impl fmt::Display for SuspicionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("unknown suspicion reason: {0}")]
pub struct UnknownReason(pub String);

impl FromStr for SuspicionReason {
    type Err = UnknownReason;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SuspicionReason::ALL
            .into_iter()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| UnknownReason(s.to_string()))
    }
}

/// Per-identity, per-reason record of detected behavior.
///
/// At most one flag exists for each `(identity, reason)`. Flags are never
/// deleted, only deactivated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspicionFlag {
    pub identity: String,
    pub reason: SuspicionReason,
    pub details: String,
    pub occurrence_count: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub first_seen: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
}

impl SuspicionFlag {
    /// Build a fresh, active flag from a detection.
    pub fn from_update(update: &FlagUpdate) -> Self {
        Self {
            identity: update.identity.clone(),
            reason: update.reason,
            details: update.details.clone(),
            occurrence_count: update.occurrence_count,
            first_seen: update.seen_at,
            last_seen: update.seen_at,
            is_active: true,
        }
    }

    /// Refresh an existing flag with a new detection, reactivating it.
    pub fn refresh(&mut self, update: &FlagUpdate) {
        self.details = update.details.clone();
        self.occurrence_count = update.occurrence_count;
        self.last_seen = update.seen_at;
        self.is_active = true;
    }
}

/// A detection to be written into the flag store.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagUpdate {
    pub identity: String,
    pub reason: SuspicionReason,
    pub details: String,
    pub occurrence_count: u64,
    pub seen_at: DateTime<Utc>,
}
