//! Redis-backed storage adapters.
//!
//! Key layout (all keys carry the configured prefix):
//! - `rate_limit:{anon|auth}:{subject}`: JSON array of unix-millisecond
//!   timestamps, written with `SET EX`
//! - `flags`: hash of `{identity}|{reason}` to JSON flag; upserts and sweeps
//!   run as Lua scripts so each `(identity, reason)` field is updated atomically
//! - `blocked`: hash of identity to JSON block record; inserts use `HSETNX`
//! - `request_log`: sorted set of JSON entries scored by timestamp

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use std::collections::BTreeMap;

use crate::core::memory::group_counts;
use crate::core::store::{
    BlockList, BlockedIdentity, CounterStore, FlagStore, IdentityCount, PathFilter, RequestLogEntry,
    RequestLogStore, StoreError, TimeRange,
};
use crate::core::suspicion::{FlagUpdate, SuspicionFlag, SuspicionReason};
use crate::models::RedisConfig;

const UPSERT_FLAG_SCRIPT: &str = r#"
local existing = redis.call('HGET', KEYS[1], ARGV[1])
local flag
local created = 0
if existing then
    flag = cjson.decode(existing)
    flag.details = ARGV[4]
    flag.occurrence_count = tonumber(ARGV[5])
    flag.last_seen = tonumber(ARGV[6])
    flag.is_active = true
else
    flag = {
        identity = ARGV[2],
        reason = ARGV[3],
        details = ARGV[4],
        occurrence_count = tonumber(ARGV[5]),
        first_seen = tonumber(ARGV[6]),
        last_seen = tonumber(ARGV[6]),
        is_active = true
    }
    created = 1
end
local encoded = cjson.encode(flag)
redis.call('HSET', KEYS[1], ARGV[1], encoded)
return {encoded, created}
"#;

const DEACTIVATE_FLAGS_SCRIPT: &str = r#"
local deactivated = 0
local entries = redis.call('HGETALL', KEYS[1])
for i = 1, #entries, 2 do
    local flag = cjson.decode(entries[i + 1])
    if flag.is_active and flag.last_seen < tonumber(ARGV[1]) then
        flag.is_active = false
        redis.call('HSET', KEYS[1], entries[i], cjson.encode(flag))
        deactivated = deactivated + 1
    end
end
return deactivated
"#;

/// Redis implementation of every storage port.
pub struct RedisStore {
    redis: redis::Client,
    key_prefix: String,
}

impl RedisStore {
    pub fn new(redis: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            redis,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn from_config(config: &RedisConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str())?;
        Ok(Self::new(client, config.key_prefix.clone()))
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }

    fn flag_field(identity: &str, reason: SuspicionReason) -> String {
        format!("{}|{}", identity, reason.as_str())
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StoreError> {
        Ok(self.redis.get_async_connection().await?)
    }

    /// Check connectivity.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn all_flags(&self) -> Result<Vec<SuspicionFlag>, StoreError> {
        let mut conn = self.connection().await?;
        let values: Vec<String> = conn.hvals(self.key("flags")).await?;
        values
            .iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Vec<i64>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(self.key(key)).await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    async fn set(&self, key: &str, timestamps: &[i64], ttl: std::time::Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let json = serde_json::to_string(timestamps)?;
        let seconds = ttl.as_secs().max(1) as usize;
        let _: () = conn.set_ex(self.key(key), json, seconds).await?;
        Ok(())
    }
}

#[async_trait]
impl RequestLogStore for RedisStore {
    async fn append(&self, entry: RequestLogEntry) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let score = entry.timestamp.timestamp_millis();
        let json = serde_json::to_string(&entry)?;
        let _: () = conn.zadd(self.key("request_log"), json, score).await?;
        Ok(())
    }

    async fn count_by_identity(
        &self,
        range: TimeRange,
        filter: PathFilter,
    ) -> Result<Vec<IdentityCount>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Vec<String> = conn
            .zrangebyscore(
                self.key("request_log"),
                range.start.timestamp_millis(),
                range.end.timestamp_millis(),
            )
            .await?;

        let entries = raw
            .iter()
            .map(|json| serde_json::from_str::<RequestLogEntry>(json))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(group_counts(entries.iter().filter(|entry| filter.matches(&entry.path))))
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let removed: u64 = conn
            .zrembyscore(
                self.key("request_log"),
                "-inf",
                format!("({}", cutoff.timestamp_millis()),
            )
            .await?;
        Ok(removed)
    }
}

#[async_trait]
impl FlagStore for RedisStore {
    async fn upsert(&self, update: FlagUpdate) -> Result<(SuspicionFlag, bool), StoreError> {
        let mut conn = self.connection().await?;
        let (encoded, created): (String, i64) = redis::Script::new(UPSERT_FLAG_SCRIPT)
            .key(self.key("flags"))
            .arg(Self::flag_field(&update.identity, update.reason))
            .arg(&update.identity)
            .arg(update.reason.as_str())
            .arg(&update.details)
            .arg(update.occurrence_count)
            .arg(update.seen_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok((serde_json::from_str(&encoded)?, created == 1))
    }

    async fn is_active(&self, identity: &str, reason: SuspicionReason) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .hget(self.key("flags"), Self::flag_field(identity, reason))
            .await?;
        match raw {
            Some(json) => Ok(serde_json::from_str::<SuspicionFlag>(&json)?.is_active),
            None => Ok(false),
        }
    }

    async fn list(&self) -> Result<Vec<SuspicionFlag>, StoreError> {
        self.all_flags().await
    }

    async fn list_active(&self) -> Result<Vec<(String, Vec<SuspicionReason>)>, StoreError> {
        let mut grouped: BTreeMap<String, Vec<SuspicionReason>> = BTreeMap::new();
        for flag in self.all_flags().await?.into_iter().filter(|flag| flag.is_active) {
            grouped.entry(flag.identity).or_default().push(flag.reason);
        }
        Ok(grouped.into_iter().collect())
    }

    async fn deactivate_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let deactivated: u64 = redis::Script::new(DEACTIVATE_FLAGS_SCRIPT)
            .key(self.key("flags"))
            .arg(cutoff.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(deactivated)
    }
}

#[async_trait]
impl BlockList for RedisStore {
    async fn exists(&self, identity: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        Ok(conn.hexists(self.key("blocked"), identity).await?)
    }

    async fn get(&self, identity: &str) -> Result<Option<BlockedIdentity>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.hget(self.key("blocked"), identity).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn insert_if_absent(&self, entry: BlockedIdentity) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let json = serde_json::to_string(&entry)?;
        Ok(conn.hset_nx(self.key("blocked"), &entry.identity, json).await?)
    }

    async fn put(&self, entry: BlockedIdentity) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let json = serde_json::to_string(&entry)?;
        let _: () = conn.hset(self.key("blocked"), &entry.identity, json).await?;
        Ok(())
    }

    async fn delete(&self, identity: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn.hdel(self.key("blocked"), identity).await?;
        Ok(removed > 0)
    }

    async fn list(&self) -> Result<Vec<BlockedIdentity>, StoreError> {
        let mut conn = self.connection().await?;
        let values: Vec<String> = conn.hvals(self.key("blocked")).await?;
        values
            .iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> RedisStore {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        RedisStore::new(client, format!("guard-test:{}:", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_flag_upsert_is_keyed_by_identity_and_reason() {
        let store = store();
        let now = Utc::now();
        let update = |count| FlagUpdate {
            identity: "203.0.113.5".to_string(),
            reason: SuspicionReason::HighVolume,
            details: format!("IP made {} requests", count),
            occurrence_count: count,
            seen_at: now,
        };

        let (_, created) = store.upsert(update(101)).await.unwrap();
        assert!(created);
        let (flag, created) = store.upsert(update(105)).await.unwrap();
        assert!(!created);
        assert_eq!(flag.occurrence_count, 105);
        assert_eq!(FlagStore::list(&store).await.unwrap().len(), 1);

        let deactivated = store
            .deactivate_older_than(now + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(deactivated, 1);
        assert!(!store.is_active("203.0.113.5", SuspicionReason::HighVolume).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_counter_round_trip() {
        let store = store();
        store
            .set("rate_limit:anon:192.0.2.1", &[1, 2], std::time::Duration::from_secs(70))
            .await
            .unwrap();
        assert_eq!(
            CounterStore::get(&store, "rate_limit:anon:192.0.2.1").await.unwrap(),
            vec![1, 2]
        );
        assert!(CounterStore::get(&store, "rate_limit:anon:192.0.2.2")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_request_log_prune_before() {
        let store = store();
        let now = Utc::now();
        store
            .append(RequestLogEntry::new("192.0.2.1", "/", now - Duration::hours(3)))
            .await
            .unwrap();
        store.append(RequestLogEntry::new("192.0.2.1", "/", now)).await.unwrap();

        assert_eq!(store.prune_before(now - Duration::hours(1)).await.unwrap(), 1);
        let counts = store
            .count_by_identity(TimeRange::trailing(now, Duration::days(1)), PathFilter::Any)
            .await
            .unwrap();
        assert_eq!(counts[0].count, 1);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_block_insert_if_absent() {
        let store = store();
        let entry = BlockedIdentity {
            identity: "192.0.2.1".to_string(),
            created_at: Utc::now(),
            reason: "manual".to_string(),
        };
        assert!(store.insert_if_absent(entry.clone()).await.unwrap());
        assert!(!store.insert_if_absent(entry).await.unwrap());
        assert!(store.exists("192.0.2.1").await.unwrap());
        assert!(store.delete("192.0.2.1").await.unwrap());
    }
}
