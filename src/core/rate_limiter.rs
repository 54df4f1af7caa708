//! Sliding-window rate limiting for the guard service.
//!
//! Each [`RateLimitKey`] owns an ordered sequence of request timestamps in
//! the counter store. A check prunes entries that fell out of the trailing
//! window, rejects when the remaining count has reached the limit, and
//! otherwise appends the current time and writes the window back with a TTL
//! of `window + grace` so idle keys are reclaimed by the store.
//!
//! The read-modify-write runs under a per-key lock, so concurrent requests
//! for the same key within one process never both take the last slot.

use log::warn;
use metrics::increment_counter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::clock::Clock;
use crate::core::identity::{RateLimitKey, RateLimitScope};
use crate::core::policy::Decision;
use crate::core::store::{CounterStore, StoreError};
use crate::models::{RateLimitConfig, WindowPolicy};

/// Per-key async locks, dropped once no request holds them.
#[derive(Default)]
struct KeyLocks {
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    fn acquire(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(key.to_string()).or_default().clone()
    }

    fn release(&self, key: &str, slot: Arc<tokio::sync::Mutex<()>>) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        drop(slot);
        if slots.get(key).map(|s| Arc::strong_count(s) == 1).unwrap_or(false) {
            slots.remove(key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Sliding-window rate limiter over an injected counter store
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
    locks: KeyLocks,
}

impl RateLimiter {
    /// Create a new rate limiter instance
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, config: RateLimitConfig) -> Self {
        Self {
            store,
            clock,
            config,
            locks: KeyLocks::default(),
        }
    }

    /// Whether `path` bypasses rate limiting entirely.
    pub fn is_exempt(&self, path: &str) -> bool {
        self.config
            .exempt_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Configured policy for a scope.
    pub fn policy_for(&self, scope: RateLimitScope) -> Option<WindowPolicy> {
        self.config.policies.get(&scope).copied()
    }

    /// Check a key against its scope's configured policy.
    ///
    /// A scope without a policy is not limited.
    pub async fn allow(&self, key: &RateLimitKey) -> Decision {
        match self.policy_for(key.scope) {
            Some(policy) => self.allow_with(key, policy).await,
            None => Decision::Allow,
        }
    }

    /// Check a key against an explicit policy, resolving backend failures
    /// through the configured [`FailurePolicy`](crate::core::policy::FailurePolicy).
    pub async fn allow_with(&self, key: &RateLimitKey, policy: WindowPolicy) -> Decision {
        match self.check_rate_limit(key, policy).await {
            Ok(true) => Decision::Allow,
            Ok(false) => {
                increment_counter!("guard_requests_rate_limited_total", "scope" => key.scope.as_str());
                warn!(
                    "Rate limit exceeded for {} caller {}",
                    key.scope, key.subject
                );
                Decision::Deny
            }
            Err(e) => {
                increment_counter!("guard_backend_fallbacks_total", "component" => "rate_limiter");
                warn!(
                    "Error checking rate limit for key {}: {} (failure policy: {:?})",
                    key, e, self.config.failure_policy
                );
                Decision::Fallback(self.config.failure_policy)
            }
        }
    }

    /// Check if a request fits in the window
    ///
    /// # Returns
    ///
    /// * `Ok(true)` if the request was admitted and recorded
    /// * `Ok(false)` if the window is full; stored state is left untouched
    /// * `Err(StoreError)` if the counter backend failed
    pub async fn check_rate_limit(&self, key: &RateLimitKey, policy: WindowPolicy) -> Result<bool, StoreError> {
        let storage_key = key.storage_key();
        let slot = self.locks.acquire(&storage_key);
        let admitted = {
            let _guard = slot.lock().await;
            self.admit(&storage_key, policy).await
        };
        self.locks.release(&storage_key, slot);
        admitted
    }

    async fn admit(&self, storage_key: &str, policy: WindowPolicy) -> Result<bool, StoreError> {
        let now = self.clock.now().timestamp_millis();
        let window_start = now - (policy.window_seconds as i64) * 1000;

        let mut timestamps = self.store.get(storage_key).await?;
        timestamps.retain(|&t| t > window_start);

        if timestamps.len() >= policy.limit as usize {
            return Ok(false);
        }

        timestamps.push(now);
        let ttl = policy.window() + Duration::from_secs(self.config.grace_seconds);
        self.store.set(storage_key, &timestamps, ttl).await?;
        Ok(true)
    }

    /// Requests currently counted in the window for `key`.
    pub async fn current_usage(&self, key: &RateLimitKey, policy: WindowPolicy) -> Result<usize, StoreError> {
        let window_start = self.clock.now().timestamp_millis() - (policy.window_seconds as i64) * 1000;
        let timestamps = self.store.get(&key.storage_key()).await?;
        Ok(timestamps.iter().filter(|&&t| t > window_start).count())
    }

    /// Reset the window for a given key
    pub async fn reset_rate_limit(&self, key: &RateLimitKey) -> Result<(), StoreError> {
        self.store
            .set(&key.storage_key(), &[], Duration::from_secs(1))
            .await
    }
}
