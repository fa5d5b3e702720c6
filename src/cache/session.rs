//! Session-scoped aggregation cache
//!
//! Stores each entry as a JSON envelope `{data, timestamp, ttl}` in a
//! string key/value [`SessionStorage`]. An entry older than its TTL is
//! treated as absent and removed when read.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::{check_cacheable, CacheCounters, CacheKey, CacheStatsSnapshot, MetricsCache};
use crate::aggregation::AggregatedMetricsData;
use crate::config::CacheConfig;

/// Prefix separating aggregator entries from anything else in the storage
const KEY_PREFIX: &str = "rollup:";

/// String key/value storage scoped to a session
pub trait SessionStorage: Send + Sync {
    /// Read a value
    fn get_item(&self, key: &str) -> Option<String>;

    /// Write a value
    fn set_item(&self, key: &str, value: String);

    /// Remove a value
    fn remove_item(&self, key: &str);

    /// All keys currently stored
    fn keys(&self) -> Vec<String>;
}

/// Session storage kept in process memory
#[derive(Default)]
pub struct MemorySessionStorage {
    items: RwLock<HashMap<String, String>>,
}

impl MemorySessionStorage {
    /// Create empty storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemorySessionStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.read().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: String) {
        self.items.write().insert(key.to_string(), value);
    }

    fn remove_item(&self, key: &str) {
        self.items.write().remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.items.read().keys().cloned().collect()
    }
}

/// Serialized entry
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    /// Cached aggregate
    data: AggregatedMetricsData,
    /// Write time, milliseconds since epoch
    timestamp: i64,
    /// Time-to-live in milliseconds
    ttl: i64,
}

impl Envelope {
    fn is_expired(&self, now_ms: i64) -> bool {
        now_ms - self.timestamp > self.ttl
    }
}

/// TTL cache over a [`SessionStorage`]
pub struct SessionCache<S: SessionStorage> {
    storage: S,
    ttl_ms: i64,
    max_cacheable_count: u64,
    counters: CacheCounters,
}

impl<S: SessionStorage> SessionCache<S> {
    /// Create a session cache
    pub fn new(storage: S, ttl: Duration, max_cacheable_count: u64) -> Self {
        Self {
            storage,
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
            max_cacheable_count,
            counters: CacheCounters::default(),
        }
    }

    /// Create a session cache from configuration
    pub fn from_config(storage: S, config: &CacheConfig) -> Self {
        Self::new(storage, config.session_ttl(), config.max_cacheable_count)
    }

    /// Underlying storage
    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn storage_key(key: &CacheKey) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }

    /// Read and validate an envelope, evicting it if expired or malformed
    fn load(&self, storage_key: &str, now_ms: i64) -> Option<AggregatedMetricsData> {
        let raw = self.storage.get_item(storage_key)?;
        match serde_json::from_str::<Envelope>(&raw) {
            Ok(envelope) if envelope.is_expired(now_ms) => {
                self.storage.remove_item(storage_key);
                self.counters.expire();
                debug!(key = storage_key, "Evicted expired session cache entry");
                None
            }
            Ok(envelope) => Some(envelope.data),
            Err(e) => {
                warn!(key = storage_key, error = %e, "Dropping malformed session cache entry");
                self.storage.remove_item(storage_key);
                None
            }
        }
    }
}

impl<S: SessionStorage> MetricsCache for SessionCache<S> {
    fn get(&self, key: &CacheKey) -> Option<AggregatedMetricsData> {
        match self.peek(key) {
            Some(value) => {
                self.counters.hit();
                Some(value)
            }
            None => {
                self.counters.miss();
                None
            }
        }
    }

    fn peek(&self, key: &CacheKey) -> Option<AggregatedMetricsData> {
        self.load(&Self::storage_key(key), Utc::now().timestamp_millis())
    }

    fn set(&self, key: &CacheKey, value: &AggregatedMetricsData) -> bool {
        if let Err(reason) = check_cacheable(value, self.max_cacheable_count) {
            warn!(
                key = %key,
                count = value.count,
                reason = reason.as_str(),
                "Refusing to cache implausible aggregate"
            );
            self.counters.reject(reason);
            return false;
        }

        let envelope = Envelope {
            data: value.clone(),
            timestamp: Utc::now().timestamp_millis(),
            ttl: self.ttl_ms,
        };
        match serde_json::to_string(&envelope) {
            Ok(raw) => {
                self.storage.set_item(&Self::storage_key(key), raw);
                true
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to serialize session cache entry");
                false
            }
        }
    }

    fn stats(&self) -> CacheStatsSnapshot {
        let now_ms = Utc::now().timestamp_millis();
        let mut keys: Vec<String> = self
            .storage
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(KEY_PREFIX))
            .filter(|k| self.load(k, now_ms).is_some())
            .map(|k| k[KEY_PREFIX.len()..].to_string())
            .collect();
        keys.sort();
        self.counters.snapshot(keys)
    }

    fn clear(&self) {
        for key in self.storage.keys() {
            if key.starts_with(KEY_PREFIX) {
                self.storage.remove_item(&key);
            }
        }
        debug!("Cleared session cache");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AggregationRequest, RecordKind};
    use chrono::TimeZone;

    fn key() -> CacheKey {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let request = AggregationRequest::new(
            "acct",
            RecordKind::Items,
            start,
            start + chrono::Duration::minutes(15),
        )
        .unwrap();
        CacheKey::for_request(&request)
    }

    fn value() -> AggregatedMetricsData {
        AggregatedMetricsData {
            count: 2,
            sum: 2.0,
            avg: 1.0,
            valid_count: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_round_trip_through_storage() {
        let cache = SessionCache::new(MemorySessionStorage::new(), Duration::from_secs(60), 100);
        assert!(cache.set(&key(), &value()));
        assert_eq!(cache.get(&key()), Some(value()));

        let raw = cache.storage().get_item(&format!("rollup:{}", key())).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(json.get("data").is_some());
        assert!(json.get("timestamp").is_some());
        assert_eq!(json["ttl"], 60_000);
    }

    #[test]
    fn test_expired_entry_is_evicted_on_get() {
        let cache = SessionCache::new(MemorySessionStorage::new(), Duration::from_secs(60), 100);
        let stale = Envelope {
            data: value(),
            timestamp: Utc::now().timestamp_millis() - 120_000,
            ttl: 60_000,
        };
        let storage_key = format!("rollup:{}", key());
        cache
            .storage()
            .set_item(&storage_key, serde_json::to_string(&stale).unwrap());

        assert!(cache.get(&key()).is_none());
        assert!(cache.storage().get_item(&storage_key).is_none());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_malformed_entry_is_dropped() {
        let cache = SessionCache::new(MemorySessionStorage::new(), Duration::from_secs(60), 100);
        let storage_key = format!("rollup:{}", key());
        cache.storage().set_item(&storage_key, "{not json".to_string());
        assert!(cache.get(&key()).is_none());
        assert!(cache.storage().keys().is_empty());
    }

    #[test]
    fn test_rejects_over_ceiling() {
        let cache = SessionCache::new(MemorySessionStorage::new(), Duration::from_secs(60), 1);
        assert!(!cache.set(&key(), &value()));
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_clear_leaves_foreign_keys() {
        let cache = SessionCache::new(MemorySessionStorage::new(), Duration::from_secs(60), 100);
        cache.storage().set_item("theme", "dark".to_string());
        cache.set(&key(), &value());
        assert_eq!(cache.stats().size, 1);

        cache.clear();
        assert_eq!(cache.stats().size, 0);
        assert_eq!(cache.storage().get_item("theme").as_deref(), Some("dark"));
    }
}
