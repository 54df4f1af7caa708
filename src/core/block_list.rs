//! Block list gate and operator actions.
//!
//! The gate is the hard security boundary on the request path. It applies to
//! every path, including those exempt from rate limiting.

use chrono::{DateTime, Utc};
use log::{info, warn};
use metrics::increment_counter;
use serde::Serialize;
use std::sync::Arc;

use crate::core::clock::Clock;
use crate::core::policy::{Decision, FailurePolicy};
use crate::core::store::{BlockList, BlockedIdentity, StoreError};

/// Outcome of an operator block request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum BlockOutcome {
    Created { entry: BlockedIdentity },
    Updated { entry: BlockedIdentity },
    AlreadyBlocked { entry: Option<BlockedIdentity> },
}

pub struct BlockListGate {
    store: Arc<dyn BlockList>,
    clock: Arc<dyn Clock>,
    failure_policy: FailurePolicy,
}

impl BlockListGate {
    pub fn new(store: Arc<dyn BlockList>, clock: Arc<dyn Clock>, failure_policy: FailurePolicy) -> Self {
        Self {
            store,
            clock,
            failure_policy,
        }
    }

    /// Gate decision for `identity`. [`Decision::Deny`] means blocked.
    pub async fn check(&self, identity: &str) -> Decision {
        match self.store.exists(identity).await {
            Ok(false) => Decision::Allow,
            Ok(true) => {
                increment_counter!("guard_requests_blocked_total");
                warn!("Blocked request from {}", identity);
                Decision::Deny
            }
            Err(e) => {
                increment_counter!("guard_backend_fallbacks_total", "component" => "block_list");
                warn!(
                    "Error checking block list for {}: {} (failure policy: {:?})",
                    identity, e, self.failure_policy
                );
                Decision::Fallback(self.failure_policy)
            }
        }
    }

    /// Whether `identity` is blocked, with backend failures resolved by policy.
    pub async fn is_blocked(&self, identity: &str) -> bool {
        !self.check(identity).await.is_allowed()
    }

    /// Block an identity on operator request.
    ///
    /// An existing block keeps its reason unless `force` is set.
    pub async fn block(&self, identity: &str, reason: &str, force: bool) -> Result<BlockOutcome, StoreError> {
        let entry = self.entry(identity, reason, self.clock.now());
        if self.store.insert_if_absent(entry.clone()).await? {
            info!("Blocked {}: {}", identity, display_reason(reason));
            return Ok(BlockOutcome::Created { entry });
        }

        if !force {
            return Ok(BlockOutcome::AlreadyBlocked {
                entry: self.store.get(identity).await?,
            });
        }

        let created_at = self
            .store
            .get(identity)
            .await?
            .map(|existing| existing.created_at)
            .unwrap_or(entry.created_at);
        let entry = self.entry(identity, reason, created_at);
        self.store.put(entry.clone()).await?;
        info!("Updated block for {}: {}", identity, display_reason(reason));
        Ok(BlockOutcome::Updated { entry })
    }

    /// Remove a block. Returns `false` when the identity was not blocked.
    pub async fn unblock(&self, identity: &str) -> Result<bool, StoreError> {
        let removed = self.store.delete(identity).await?;
        if removed {
            info!("Unblocked {}", identity);
        }
        Ok(removed)
    }

    pub async fn list(&self) -> Result<Vec<BlockedIdentity>, StoreError> {
        self.store.list().await
    }

    fn entry(&self, identity: &str, reason: &str, created_at: DateTime<Utc>) -> BlockedIdentity {
        BlockedIdentity {
            identity: identity.to_string(),
            created_at,
            reason: reason.to_string(),
        }
    }
}

fn display_reason(reason: &str) -> &str {
    if reason.is_empty() {
        "No reason provided"
    } else {
        reason
    }
}
