//! Storage ports consumed by the guard components.
//!
//! Every adapter (in-memory or Redis) implements these traits; the rate
//! limiter, block gate, classifier, escalator and expiry sweep only ever see
//! the traits, injected at construction time.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::suspicion::{FlagUpdate, SuspicionFlag, SuspicionReason};

#[cfg(test)]
use mockall::automock;

/// Errors raised by storage adapters
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("stored record is unreadable: {0}")]
    CorruptRecord(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::BackendUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::CorruptRecord(err.to_string())
    }
}

/// One observed request, as recorded by the request log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub id: Uuid,
    pub identity: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub path: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

impl RequestLogEntry {
    pub fn new(identity: impl Into<String>, path: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity: identity.into(),
            timestamp,
            path: path.into(),
            country: None,
            city: None,
        }
    }
}

/// Inclusive time range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// The window of length `span` ending at `end`.
    pub fn trailing(end: DateTime<Utc>, span: Duration) -> Self {
        Self { start: end - span, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

/// Restriction on request paths when aggregating the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathFilter {
    Any,
    Prefix(String),
    Exact(String),
}

impl PathFilter {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathFilter::Any => true,
            PathFilter::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathFilter::Exact(exact) => path == exact,
        }
    }
}

/// Aggregated request count for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityCount {
    pub identity: String,
    pub count: u64,
}

/// An identity denied access to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedIdentity {
    pub identity: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    pub reason: String,
}

/// Timestamp sequences backing the sliding-window rate limiter.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Stored timestamps (unix milliseconds) for `key`; empty when absent or expired.
    async fn get(&self, key: &str) -> Result<Vec<i64>, StoreError>;

    /// Replace the timestamps for `key`, expiring the whole entry after `ttl`.
    async fn set(&self, key: &str, timestamps: &[i64], ttl: std::time::Duration) -> Result<(), StoreError>;
}

/// Append-only log of requests, queryable by grouped counts.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RequestLogStore: Send + Sync {
    async fn append(&self, entry: RequestLogEntry) -> Result<(), StoreError>;

    /// Count entries per identity within `range` whose path matches `filter`.
    async fn count_by_identity(
        &self,
        range: TimeRange,
        filter: PathFilter,
    ) -> Result<Vec<IdentityCount>, StoreError>;

    /// Remove entries older than `cutoff`. Returns how many were removed.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Owned store of suspicion flags keyed by `(identity, reason)`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FlagStore: Send + Sync {
    /// Atomically create or refresh the flag for `(identity, reason)`.
    ///
    /// Returns the stored flag and whether it was newly created.
    async fn upsert(&self, update: FlagUpdate) -> Result<(SuspicionFlag, bool), StoreError>;

    async fn is_active(&self, identity: &str, reason: SuspicionReason) -> Result<bool, StoreError>;

    async fn list(&self) -> Result<Vec<SuspicionFlag>, StoreError>;

    /// Active flag reasons grouped by identity.
    async fn list_active(&self) -> Result<Vec<(String, Vec<SuspicionReason>)>, StoreError>;

    /// Deactivate every active flag last seen before `cutoff`.
    async fn deactivate_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Owned set of blocked identities.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BlockList: Send + Sync {
    async fn exists(&self, identity: &str) -> Result<bool, StoreError>;

    async fn get(&self, identity: &str) -> Result<Option<BlockedIdentity>, StoreError>;

    /// Insert unless the identity is already blocked. Returns `true` when inserted.
    async fn insert_if_absent(&self, entry: BlockedIdentity) -> Result<bool, StoreError>;

    /// Insert or overwrite.
    async fn put(&self, entry: BlockedIdentity) -> Result<(), StoreError>;

    /// Remove a block. Returns `true` when one existed.
    async fn delete(&self, identity: &str) -> Result<bool, StoreError>;

    async fn list(&self) -> Result<Vec<BlockedIdentity>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_path_filters() {
        assert!(PathFilter::Any.matches("/anything"));
        assert!(PathFilter::Prefix("/admin/".into()).matches("/admin/login/"));
        assert!(!PathFilter::Prefix("/admin/".into()).matches("/administrator"));
        assert!(PathFilter::Exact("/api/login/".into()).matches("/api/login/"));
        assert!(!PathFilter::Exact("/api/login/".into()).matches("/api/login/reset"));
    }

    #[test]
    fn test_trailing_range_is_inclusive() {
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let range = TimeRange::trailing(end, Duration::hours(1));

        assert!(range.contains(end));
        assert!(range.contains(end - Duration::hours(1)));
        assert!(!range.contains(end - Duration::hours(1) - Duration::milliseconds(1)));
        assert!(!range.contains(end + Duration::milliseconds(1)));
    }
}
