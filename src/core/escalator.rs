//! Auto-block escalation of repeatedly flagged identities.

use chrono::{DateTime, Utc};
use log::{info, warn};
use metrics::increment_counter;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::core::clock::Clock;
use crate::core::store::{BlockList, BlockedIdentity, FlagStore, StoreError};
use crate::core::suspicion::SuspicionReason;
use crate::models::EscalationConfig;

/// Result of an escalation run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EscalationSummary {
    pub blocked_count: usize,
    /// Identities blocked by this run
    pub blocked: Vec<String>,
}

/// Blocks identities holding enough distinct active flags.
///
/// Blocks are never lifted here; unblocking is an operator action.
pub struct Escalator {
    flags: Arc<dyn FlagStore>,
    blocks: Arc<dyn BlockList>,
    clock: Arc<dyn Clock>,
    config: EscalationConfig,
}

impl Escalator {
    pub fn new(
        flags: Arc<dyn FlagStore>,
        blocks: Arc<dyn BlockList>,
        clock: Arc<dyn Clock>,
        config: EscalationConfig,
    ) -> Self {
        Self {
            flags,
            blocks,
            clock,
            config,
        }
    }

    pub async fn run_escalation(&self) -> Result<EscalationSummary, StoreError> {
        info!("Checking for IPs to auto-block...");
        let now = self.clock.now();
        let mut summary = EscalationSummary::default();

        for (identity, reasons) in self.flags.list_active().await? {
            let distinct: BTreeSet<SuspicionReason> = reasons.into_iter().collect();
            if distinct.len() < self.config.min_distinct_reasons {
                continue;
            }

            let entry = Self::block_entry(&identity, &distinct, now);
            if self.blocks.insert_if_absent(entry).await? {
                increment_counter!("guard_identities_auto_blocked_total");
                warn!(
                    "Auto-blocked {} for {} distinct suspicious activities",
                    identity,
                    distinct.len()
                );
                summary.blocked.push(identity);
            }
        }

        summary.blocked_count = summary.blocked.len();
        info!("Auto-blocked {} IPs", summary.blocked_count);
        Ok(summary)
    }

    fn block_entry(identity: &str, reasons: &BTreeSet<SuspicionReason>, now: DateTime<Utc>) -> BlockedIdentity {
        let labels: Vec<&str> = reasons.iter().map(|reason| reason.label()).collect();
        BlockedIdentity {
            identity: identity.to_string(),
            created_at: now,
            reason: format!(
                "Auto-blocked due to multiple suspicious activities: {}",
                labels.join(", ")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::memory::{MemoryBlockList, MemoryFlagStore};
    use crate::core::suspicion::FlagUpdate;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap()
    }

    async fn flag(store: &MemoryFlagStore, identity: &str, reason: SuspicionReason) {
        store
            .upsert(FlagUpdate {
                identity: identity.to_string(),
                reason,
                details: "test".to_string(),
                occurrence_count: 1,
                seen_at: now(),
            })
            .await
            .unwrap();
    }

    fn escalator(flags: Arc<MemoryFlagStore>, blocks: Arc<MemoryBlockList>) -> Escalator {
        Escalator::new(
            flags,
            blocks,
            Arc::new(ManualClock::new(now())),
            EscalationConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_three_distinct_reasons_block_once() {
        let flags = Arc::new(MemoryFlagStore::new());
        let blocks = Arc::new(MemoryBlockList::new());
        flag(&flags, "203.0.113.7", SuspicionReason::AdminAccess).await;
        flag(&flags, "203.0.113.7", SuspicionReason::HighVolume).await;
        flag(&flags, "203.0.113.7", SuspicionReason::SensitivePaths).await;

        let escalator = escalator(flags, blocks.clone());
        let summary = escalator.run_escalation().await.unwrap();
        assert_eq!(summary.blocked_count, 1);
        assert_eq!(summary.blocked, vec!["203.0.113.7".to_string()]);

        let entry = blocks.get("203.0.113.7").await.unwrap().unwrap();
        assert_eq!(
            entry.reason,
            "Auto-blocked due to multiple suspicious activities: High request volume, Sensitive path access, Admin panel access attempts"
        );
        assert_eq!(entry.created_at, now());

        let again = escalator.run_escalation().await.unwrap();
        assert_eq!(again.blocked_count, 0);
        assert_eq!(blocks.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fewer_reasons_are_not_blocked() {
        let flags = Arc::new(MemoryFlagStore::new());
        let blocks = Arc::new(MemoryBlockList::new());
        flag(&flags, "203.0.113.8", SuspicionReason::HighVolume).await;
        flag(&flags, "203.0.113.8", SuspicionReason::BruteForce).await;

        let summary = escalator(flags, blocks.clone()).run_escalation().await.unwrap();
        assert_eq!(summary.blocked_count, 0);
        assert!(!blocks.exists("203.0.113.8").await.unwrap());
    }

    #[tokio::test]
    async fn test_inactive_flags_do_not_count() {
        let flags = Arc::new(MemoryFlagStore::new());
        let blocks = Arc::new(MemoryBlockList::new());
        flag(&flags, "203.0.113.9", SuspicionReason::HighVolume).await;
        flag(&flags, "203.0.113.9", SuspicionReason::AdminAccess).await;
        flags.deactivate_older_than(now() + chrono::Duration::seconds(1)).await.unwrap();
        flag(&flags, "203.0.113.9", SuspicionReason::FailedLogins).await;

        let summary = escalator(flags, blocks).run_escalation().await.unwrap();
        assert_eq!(summary.blocked_count, 0);
    }

    #[tokio::test]
    async fn test_existing_operator_block_is_left_alone() {
        let flags = Arc::new(MemoryFlagStore::new());
        let blocks = Arc::new(MemoryBlockList::new());
        for reason in SuspicionReason::ALL {
            flag(&flags, "203.0.113.10", reason).await;
        }
        blocks
            .insert_if_absent(BlockedIdentity {
                identity: "203.0.113.10".to_string(),
                created_at: now(),
                reason: "manual".to_string(),
            })
            .await
            .unwrap();

        let summary = escalator(flags, blocks.clone()).run_escalation().await.unwrap();
        assert_eq!(summary.blocked_count, 0);
        assert_eq!(blocks.get("203.0.113.10").await.unwrap().unwrap().reason, "manual");
    }
}
