//! Deactivation of stale suspicion flags and trimming of the request log.

use chrono::Duration;
use log::info;
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;

use crate::core::clock::Clock;
use crate::core::store::{FlagStore, RequestLogStore, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExpirySummary {
    pub deactivated_count: u64,
    /// Request log entries dropped for being older than the log retention
    pub pruned_log_entries: u64,
}

/// Marks flags inactive once they have not been seen for the retention period
/// and drops request log entries no classification pass can still read.
/// Flags are kept for audit, never deleted.
pub struct ExpirySweeper {
    flags: Arc<dyn FlagStore>,
    request_log: Arc<dyn RequestLogStore>,
    clock: Arc<dyn Clock>,
    log_retention: Duration,
}

impl ExpirySweeper {
    pub fn new(
        flags: Arc<dyn FlagStore>,
        request_log: Arc<dyn RequestLogStore>,
        clock: Arc<dyn Clock>,
        log_retention: Duration,
    ) -> Self {
        Self {
            flags,
            request_log,
            clock,
            log_retention,
        }
    }

    pub async fn run_expiry_sweep(&self, retention: Duration) -> Result<ExpirySummary, StoreError> {
        let now = self.clock.now();
        let deactivated_count = self.flags.deactivate_older_than(now - retention).await?;
        counter!("guard_flags_deactivated_total", deactivated_count);
        info!("Cleaned up {} old suspicious activity records", deactivated_count);

        let pruned_log_entries = self.request_log.prune_before(now - self.log_retention).await?;
        counter!("guard_request_log_pruned_total", pruned_log_entries);
        info!("Pruned {} request log entries", pruned_log_entries);

        Ok(ExpirySummary {
            deactivated_count,
            pruned_log_entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::memory::{MemoryFlagStore, MemoryRequestLog};
    use crate::core::store::RequestLogEntry;
    use crate::core::suspicion::{FlagUpdate, SuspicionReason};
    use chrono::{DateTime, TimeZone, Utc};
    use tokio_test::assert_ok;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap()
    }

    async fn seen(store: &MemoryFlagStore, identity: &str, at: DateTime<Utc>) {
        store
            .upsert(FlagUpdate {
                identity: identity.to_string(),
                reason: SuspicionReason::HighVolume,
                details: "test".to_string(),
                occurrence_count: 101,
                seen_at: at,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_only_stale_flags_are_deactivated() {
        let flags = Arc::new(MemoryFlagStore::new());
        seen(&flags, "198.51.100.8", now() - Duration::days(8)).await;
        seen(&flags, "198.51.100.6", now() - Duration::days(6)).await;

        let sweeper = ExpirySweeper::new(
            flags.clone(),
            Arc::new(MemoryRequestLog::new()),
            Arc::new(ManualClock::new(now())),
            Duration::hours(2),
        );
        let summary = assert_ok!(sweeper.run_expiry_sweep(Duration::days(7)).await);
        assert_eq!(summary.deactivated_count, 1);

        let stale = flags.get("198.51.100.8", SuspicionReason::HighVolume).await.unwrap();
        assert!(!stale.is_active);
        assert!(flags.is_active("198.51.100.6", SuspicionReason::HighVolume).await.unwrap());
        assert_eq!(flags.list().await.unwrap().len(), 2);

        let again = sweeper.run_expiry_sweep(Duration::days(7)).await.unwrap();
        assert_eq!(again.deactivated_count, 0);
    }

    #[tokio::test]
    async fn test_sweep_prunes_request_log_past_retention() {
        let log = Arc::new(MemoryRequestLog::new());
        for minutes in [1, 90, 119, 121, 600, 3000] {
            log.append(RequestLogEntry::new(
                "203.0.113.9",
                "/",
                now() - Duration::minutes(minutes),
            ))
            .await
            .unwrap();
        }

        let sweeper = ExpirySweeper::new(
            Arc::new(MemoryFlagStore::new()),
            log.clone(),
            Arc::new(ManualClock::new(now())),
            Duration::hours(2),
        );
        let summary = assert_ok!(sweeper.run_expiry_sweep(Duration::days(7)).await);
        assert_eq!(summary.pruned_log_entries, 3);
        assert_eq!(log.len().await, 3);

        let again = sweeper.run_expiry_sweep(Duration::days(7)).await.unwrap();
        assert_eq!(again.pruned_log_entries, 0);
    }
}
