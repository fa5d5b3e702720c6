//! Aggregation cache
//!
//! Caches leaf-bucket aggregates under a canonical key built from
//! (account, kind, sub-filters, start, end). Two variants share the
//! [`MetricsCache`] interface:
//!
//! - [`AggregationCache`]: in-memory, entries never expire
//! - [`SessionCache`]: serialized entries with a TTL, evicted on read
//!
//! Both refuse to store results that fail the sanity check (count above the
//! configured ceiling, or a non-finite sum), but the caller still gets the
//! computed value. [`PendingRequests`] deduplicates concurrent computations
//! of the same key.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::aggregation::AggregatedMetricsData;
use crate::types::{to_iso, AggregationRequest};

mod memory;
mod pending;
mod session;

pub use memory::AggregationCache;
pub use pending::PendingRequests;
pub use session::{MemorySessionStorage, SessionCache, SessionStorage};

// ============================================================================
// Cache Key
// ============================================================================

/// Canonical cache key
///
/// Two requests produce the same key iff they denote the same bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build the key for a request's window
    pub fn for_request(request: &AggregationRequest) -> Self {
        let filters = request.filters();
        let window = request.window();
        CacheKey(format!(
            "{}|{}|{}|{}|{}|{}|{}",
            request.account_id(),
            request.kind().as_str(),
            filters.scorecard_id.as_deref().unwrap_or("*"),
            filters.score_id.as_deref().unwrap_or("*"),
            filters.subtype.as_deref().unwrap_or("*"),
            to_iso(window.start),
            to_iso(window.end),
        ))
    }

    /// Key as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Cache Interface
// ============================================================================

/// Store of leaf-bucket aggregates
pub trait MetricsCache: Send + Sync {
    /// Look up a cached aggregate
    fn get(&self, key: &CacheKey) -> Option<AggregatedMetricsData>;

    /// Look up a cached aggregate without touching the hit/miss counters
    fn peek(&self, key: &CacheKey) -> Option<AggregatedMetricsData>;

    /// Cache an aggregate
    ///
    /// Returns `false` when the value failed the sanity check and was not
    /// stored.
    fn set(&self, key: &CacheKey, value: &AggregatedMetricsData) -> bool;

    /// Current size, keys and counters
    fn stats(&self) -> CacheStatsSnapshot;

    /// Drop every entry
    fn clear(&self);
}

/// Reason a value was refused by the sanity check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Count above the configured ceiling
    CountCeiling,
    /// Sum or avg is NaN / infinite
    NonFinite,
}

impl Rejection {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::CountCeiling => "count_ceiling",
            Rejection::NonFinite => "non_finite",
        }
    }
}

/// Write-time sanity check shared by both cache variants
pub fn check_cacheable(
    value: &AggregatedMetricsData,
    max_count: u64,
) -> Result<(), Rejection> {
    if value.count > max_count {
        return Err(Rejection::CountCeiling);
    }
    if !value.sum.is_finite() || !value.avg.is_finite() || !value.cost.is_finite() {
        return Err(Rejection::NonFinite);
    }
    Ok(())
}

// ============================================================================
// Statistics
// ============================================================================

/// Cache counters
#[derive(Debug, Default)]
pub struct CacheCounters {
    /// Total cache hits
    pub hits: AtomicU64,

    /// Total cache misses
    pub misses: AtomicU64,

    /// Writes refused by the sanity check
    pub rejections: AtomicU64,

    /// Entries dropped because their TTL passed
    pub expirations: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_lookup(true);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_lookup(false);
    }

    pub(crate) fn reject(&self, reason: Rejection) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_rejection(reason.as_str());
    }

    pub(crate) fn expire(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, keys: Vec<String>) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            size: keys.len(),
            keys,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of cache state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    /// Number of entries
    pub size: usize,
    /// Entry keys, sorted
    pub keys: Vec<String>,
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Writes refused by the sanity check
    pub rejections: u64,
    /// Entries dropped on TTL expiry
    pub expirations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RecordKind, SubFilters};
    use chrono::{TimeZone, Utc};

    fn request(filters: SubFilters) -> AggregationRequest {
        let start = Utc.with_ymd_and_hms(2024, 2, 29, 23, 45, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        AggregationRequest::new("acct-9", RecordKind::ScoreResults, start, end)
            .unwrap()
            .with_filters(filters)
    }

    #[test]
    fn test_cache_key_format() {
        let key = CacheKey::for_request(&request(SubFilters::new().scorecard("sc")));
        assert_eq!(
            key.as_str(),
            "acct-9|scoreResults|sc|*|*|2024-02-29T23:45:00.000Z|2024-03-01T00:00:00.000Z"
        );
    }

    #[test]
    fn test_cache_key_distinguishes_filters() {
        let a = CacheKey::for_request(&request(SubFilters::new()));
        let b = CacheKey::for_request(&request(SubFilters::new().score("s1")));
        let c = CacheKey::for_request(&request(SubFilters::new()));
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_sanity_check() {
        let mut value = AggregatedMetricsData::zero();
        value.count = 100_000;
        assert!(check_cacheable(&value, 100_000).is_ok());

        value.count = 100_001;
        assert_eq!(check_cacheable(&value, 100_000), Err(Rejection::CountCeiling));

        value.count = 1;
        value.sum = f64::NAN;
        assert_eq!(check_cacheable(&value, 100_000), Err(Rejection::NonFinite));
    }
}
