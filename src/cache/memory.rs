//! In-memory aggregation cache
//!
//! Entries live until `clear()`: a completed bucket's aggregate never changes.

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::{check_cacheable, CacheCounters, CacheKey, CacheStatsSnapshot, MetricsCache};
use crate::aggregation::AggregatedMetricsData;
use crate::config::CacheConfig;

/// Unbounded in-memory cache of leaf aggregates
pub struct AggregationCache {
    /// Cached entries
    entries: RwLock<HashMap<CacheKey, AggregatedMetricsData>>,

    /// Sanity ceiling on cached counts
    max_cacheable_count: u64,

    /// Statistics
    counters: CacheCounters,
}

impl AggregationCache {
    /// Create a cache with the given sanity ceiling
    pub fn new(max_cacheable_count: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_cacheable_count,
            counters: CacheCounters::default(),
        }
    }

    /// Create a cache from configuration
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_cacheable_count)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for AggregationCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl MetricsCache for AggregationCache {
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
        self.entries.read().get(key).cloned()
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

        self.entries.write().insert(key.clone(), value.clone());
        debug!(key = %key, count = value.count, "Cached bucket aggregate");
        true
    }

    fn stats(&self) -> CacheStatsSnapshot {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .keys()
            .map(|k| k.as_str().to_string())
            .collect();
        keys.sort();
        self.counters.snapshot(keys)
    }

    fn clear(&self) {
        let mut entries = self.entries.write();
        let removed = entries.len();
        entries.clear();
        debug!(removed, "Cleared aggregation cache");
    }
}
