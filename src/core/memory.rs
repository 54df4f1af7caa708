//! In-process storage adapters.
//!
//! Used for single-instance deployments and throughout the tests. Every
//! mutation happens under one tokio lock per store, which makes the flag
//! upsert and the block insert atomic by construction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::core::clock::Clock;
use crate::core::store::{
    BlockList, BlockedIdentity, CounterStore, FlagStore, IdentityCount, PathFilter, RequestLogEntry,
    RequestLogStore, StoreError, TimeRange,
};
use crate::core::suspicion::{FlagUpdate, SuspicionFlag, SuspicionReason};

struct WindowEntry {
    timestamps: Vec<i64>,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Windows {
    entries: HashMap<String, WindowEntry>,
    next_sweep: Option<DateTime<Utc>>,
}

impl Windows {
    fn purge(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.next_sweep = Some(now + chrono::Duration::seconds(SWEEP_INTERVAL_SECONDS));
        before - self.entries.len()
    }
}

/// Minimum time between sweeps of expired windows triggered by writes.
const SWEEP_INTERVAL_SECONDS: i64 = 60;

/// Rate windows held in memory, expiring against the injected clock.
///
/// Writes sweep expired windows at most once per minute, so idle keys are
/// reclaimed shortly after their TTL runs out.
pub struct MemoryCounterStore {
    clock: Arc<dyn Clock>,
    windows: Mutex<Windows>,
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            windows: Mutex::new(Windows::default()),
        }
    }

    /// Windows currently held, expired or not.
    pub async fn len(&self) -> usize {
        self.windows.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Vec<i64>, StoreError> {
        let now = self.clock.now();
        let windows = self.windows.lock().await;
        Ok(windows
            .entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.timestamps.clone())
            .unwrap_or_default())
    }

    async fn set(&self, key: &str, timestamps: &[i64], ttl: std::time::Duration) -> Result<(), StoreError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::BackendUnavailable(format!("invalid ttl: {}", e)))?;
        let now = self.clock.now();
        let mut windows = self.windows.lock().await;
        if windows.next_sweep.map_or(true, |at| now >= at) {
            let reclaimed = windows.purge(now);
            if reclaimed > 0 {
                debug!("Reclaimed {} expired rate limit windows", reclaimed);
            }
        }
        windows.entries.insert(
            key.to_string(),
            WindowEntry {
                timestamps: timestamps.to_vec(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }
}

/// Request log held in memory.
#[derive(Default)]
pub struct MemoryRequestLog {
    entries: RwLock<Vec<RequestLogEntry>>,
}

impl MemoryRequestLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl RequestLogStore for MemoryRequestLog {
    async fn append(&self, entry: RequestLogEntry) -> Result<(), StoreError> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|entry| entry.timestamp >= cutoff);
        Ok((before - entries.len()) as u64)
    }

    async fn count_by_identity(
        &self,
        range: TimeRange,
        filter: PathFilter,
    ) -> Result<Vec<IdentityCount>, StoreError> {
        let entries = self.entries.read().await;
        Ok(group_counts(
            entries
                .iter()
                .filter(|entry| range.contains(entry.timestamp) && filter.matches(&entry.path)),
        ))
    }
}

/// Count log entries per identity, ordered by identity.
pub(crate) fn group_counts<'a>(entries: impl Iterator<Item = &'a RequestLogEntry>) -> Vec<IdentityCount> {
    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    for entry in entries {
        *counts.entry(entry.identity.as_str()).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .map(|(identity, count)| IdentityCount {
            identity: identity.to_string(),
            count,
        })
        .collect()
}

/// Flags held in memory, keyed by `(identity, reason)`.
#[derive(Default)]
pub struct MemoryFlagStore {
    flags: Mutex<BTreeMap<(String, SuspicionReason), SuspicionFlag>>,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, identity: &str, reason: SuspicionReason) -> Option<SuspicionFlag> {
        let flags = self.flags.lock().await;
        flags.get(&(identity.to_string(), reason)).cloned()
    }
}

#[async_trait]
impl FlagStore for MemoryFlagStore {
    async fn upsert(&self, update: FlagUpdate) -> Result<(SuspicionFlag, bool), StoreError> {
        let mut flags = self.flags.lock().await;
        let key = (update.identity.clone(), update.reason);
        match flags.get_mut(&key) {
            Some(existing) => {
                existing.refresh(&update);
                Ok((existing.clone(), false))
            }
            None => {
                let flag = SuspicionFlag::from_update(&update);
                flags.insert(key, flag.clone());
                Ok((flag, true))
            }
        }
    }

    async fn is_active(&self, identity: &str, reason: SuspicionReason) -> Result<bool, StoreError> {
        let flags = self.flags.lock().await;
        Ok(flags
            .get(&(identity.to_string(), reason))
            .map(|flag| flag.is_active)
            .unwrap_or(false))
    }

    async fn list(&self) -> Result<Vec<SuspicionFlag>, StoreError> {
        Ok(self.flags.lock().await.values().cloned().collect())
    }

    async fn list_active(&self) -> Result<Vec<(String, Vec<SuspicionReason>)>, StoreError> {
        let flags = self.flags.lock().await;
        let mut grouped: BTreeMap<String, Vec<SuspicionReason>> = BTreeMap::new();
        for flag in flags.values().filter(|flag| flag.is_active) {
            grouped.entry(flag.identity.clone()).or_default().push(flag.reason);
        }
        Ok(grouped.into_iter().collect())
    }

    async fn deactivate_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut flags = self.flags.lock().await;
        let mut deactivated = 0;
        for flag in flags.values_mut() {
            if flag.is_active && flag.last_seen < cutoff {
                flag.is_active = false;
                deactivated += 1;
            }
        }
        Ok(deactivated)
    }
}

/// Block list held in memory.
#[derive(Default)]
pub struct MemoryBlockList {
    blocked: RwLock<BTreeMap<String, BlockedIdentity>>,
}

impl MemoryBlockList {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlockList for MemoryBlockList {
    async fn exists(&self, identity: &str) -> Result<bool, StoreError> {
        Ok(self.blocked.read().await.contains_key(identity))
    }

    async fn get(&self, identity: &str) -> Result<Option<BlockedIdentity>, StoreError> {
        Ok(self.blocked.read().await.get(identity).cloned())
    }

    async fn insert_if_absent(&self, entry: BlockedIdentity) -> Result<bool, StoreError> {
        let mut blocked = self.blocked.write().await;
        if blocked.contains_key(&entry.identity) {
            return Ok(false);
        }
        blocked.insert(entry.identity.clone(), entry);
        Ok(true)
    }

    async fn put(&self, entry: BlockedIdentity) -> Result<(), StoreError> {
        self.blocked.write().await.insert(entry.identity.clone(), entry);
        Ok(())
    }

    async fn delete(&self, identity: &str) -> Result<bool, StoreError> {
        Ok(self.blocked.write().await.remove(identity).is_some())
    }

    async fn list(&self) -> Result<Vec<BlockedIdentity>, StoreError> {
        Ok(self.blocked.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use chrono::{Duration, TimeZone};
    use std::time::Duration as StdDuration;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn update(identity: &str, reason: SuspicionReason, count: u64, at: DateTime<Utc>) -> FlagUpdate {
        FlagUpdate {
            identity: identity.to_string(),
            reason,
            details: format!("{} hits", count),
            occurrence_count: count,
            seen_at: at,
        }
    }

    #[tokio::test]
    async fn test_counter_entries_expire_with_ttl() {
        let clock = ManualClock::new(start());
        let store = MemoryCounterStore::new(Arc::new(clock.clone()));

        store.set("k", &[1, 2, 3], StdDuration::from_secs(70)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), vec![1, 2, 3]);

        clock.advance(Duration::seconds(70));
        assert!(store.get("k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idle_windows_are_reclaimed_by_later_writes() {
        let clock = ManualClock::new(start());
        let store = MemoryCounterStore::new(Arc::new(clock.clone()));

        for n in 0..10_000 {
            store
                .set(&format!("rate_limit:anon:{}", n), &[1], StdDuration::from_secs(70))
                .await
                .unwrap();
        }
        assert_eq!(store.len().await, 10_000);

        clock.advance(Duration::days(1));
        store.set("rate_limit:anon:fresh", &[2], StdDuration::from_secs(70)).await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_live_windows_survive_a_sweep() {
        let clock = ManualClock::new(start());
        let store = MemoryCounterStore::new(Arc::new(clock.clone()));

        store.set("short", &[1], StdDuration::from_secs(30)).await.unwrap();
        store.set("long", &[1], StdDuration::from_secs(600)).await.unwrap();

        clock.advance(Duration::seconds(90));
        store.set("new", &[1], StdDuration::from_secs(70)).await.unwrap();

        assert_eq!(store.len().await, 2);
        assert_eq!(store.get("long").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_request_log_prune_drops_only_older_entries() {
        let log = MemoryRequestLog::new();
        let t0 = start();
        log.append(RequestLogEntry::new("198.51.100.1", "/", t0 - Duration::hours(3))).await.unwrap();
        log.append(RequestLogEntry::new("198.51.100.1", "/", t0 - Duration::hours(2))).await.unwrap();
        log.append(RequestLogEntry::new("198.51.100.1", "/", t0)).await.unwrap();

        assert_eq!(log.prune_before(t0 - Duration::hours(2)).await.unwrap(), 1);
        assert_eq!(log.len().await, 2);
    }

    #[tokio::test]
    async fn test_request_log_groups_by_identity() {
        let log = MemoryRequestLog::new();
        let t0 = start();
        for path in ["/admin/", "/admin/users/", "/api/"] {
            log.append(RequestLogEntry::new("198.51.100.1", path, t0)).await.unwrap();
        }
        log.append(RequestLogEntry::new("198.51.100.2", "/admin/", t0)).await.unwrap();
        log.append(RequestLogEntry::new("198.51.100.2", "/admin/", t0 - Duration::hours(2)))
            .await
            .unwrap();

        let range = TimeRange::trailing(t0, Duration::hours(1));
        let counts = log
            .count_by_identity(range, PathFilter::Prefix("/admin/".into()))
            .await
            .unwrap();

        assert_eq!(
            counts,
            vec![
                IdentityCount { identity: "198.51.100.1".into(), count: 2 },
                IdentityCount { identity: "198.51.100.2".into(), count: 1 },
            ]
        );
        assert_eq!(log.len().await, 5);
    }

    #[tokio::test]
    async fn test_upsert_keeps_one_flag_per_reason() {
        let store = MemoryFlagStore::new();
        let t0 = start();

        let (first, created) = store
            .upsert(update("192.0.2.9", SuspicionReason::HighVolume, 101, t0))
            .await
            .unwrap();
        assert!(created);
        assert_eq!(first.occurrence_count, 101);

        let (second, created) = store
            .upsert(update("192.0.2.9", SuspicionReason::HighVolume, 105, t0 + Duration::hours(1)))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(second.occurrence_count, 105);
        assert_eq!(second.first_seen, t0);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_never_duplicate() {
        let store = Arc::new(MemoryFlagStore::new());
        let t0 = start();

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .upsert(update("192.0.2.9", SuspicionReason::AdminAccess, 4 + i, t0))
                        .await
                        .unwrap()
                        .1
                })
            })
            .collect();

        let created = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|created| *created.as_ref().unwrap())
            .count();

        assert_eq!(created, 1);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_active_groups_reasons() {
        let store = MemoryFlagStore::new();
        let t0 = start();
        store.upsert(update("a", SuspicionReason::HighVolume, 1, t0)).await.unwrap();
        store.upsert(update("a", SuspicionReason::AdminAccess, 1, t0)).await.unwrap();
        store.upsert(update("b", SuspicionReason::HighVolume, 1, t0)).await.unwrap();
        store.deactivate_older_than(t0 + Duration::seconds(1)).await.unwrap();
        store.upsert(update("a", SuspicionReason::BruteForce, 1, t0)).await.unwrap();

        let active = store.list_active().await.unwrap();
        assert_eq!(active, vec![("a".to_string(), vec![SuspicionReason::BruteForce])]);
    }

    #[tokio::test]
    async fn test_block_list_insert_if_absent() {
        let blocks = MemoryBlockList::new();
        let entry = BlockedIdentity {
            identity: "192.0.2.1".into(),
            created_at: start(),
            reason: "manual".into(),
        };

        assert!(blocks.insert_if_absent(entry.clone()).await.unwrap());
        assert!(!blocks.insert_if_absent(entry.clone()).await.unwrap());
        assert!(blocks.exists("192.0.2.1").await.unwrap());
        assert!(blocks.delete("192.0.2.1").await.unwrap());
        assert!(!blocks.delete("192.0.2.1").await.unwrap());
    }
}
