//! Prometheus metrics for the aggregator
//!
//! Remote fetch outcomes, retries, cache behaviour and failures. Failed
//! buckets contribute zero to results, so `rollup_fetch_failures_total` is
//! the place to look when totals seem low.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    // === Remote Store ===

    /// Page walks against the remote store by outcome
    pub static ref REMOTE_FETCHES_TOTAL: CounterVec = register_counter_vec!(
        "rollup_remote_fetches_total",
        "Bucket fetch attempts against the remote store",
        &["kind", "status"]
    ).unwrap();

    /// Retries after throttling
    pub static ref FETCH_RETRIES_TOTAL: CounterVec = register_counter_vec!(
        "rollup_fetch_retries_total",
        "Fetch retries after throttling",
        &["kind"]
    ).unwrap();

    /// Buckets that contributed zero because their fetch failed
    pub static ref FETCH_FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "rollup_fetch_failures_total",
        "Bucket fetches that failed and were reported as zero",
        &["kind", "reason"]
    ).unwrap();

    /// Page walks cut short by the page ceiling
    pub static ref PAGINATION_TRUNCATED_TOTAL: CounterVec = register_counter_vec!(
        "rollup_pagination_truncated_total",
        "Bucket fetches truncated at the page ceiling",
        &["kind"]
    ).unwrap();

    /// Page walk duration
    pub static ref FETCH_DURATION: HistogramVec = register_histogram_vec!(
        "rollup_fetch_duration_seconds",
        "Bucket fetch latency in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).unwrap();

    // === Cache ===

    /// Cache lookups by result
    pub static ref CACHE_LOOKUPS_TOTAL: CounterVec = register_counter_vec!(
        "rollup_cache_lookups_total",
        "Leaf cache lookups",
        &["result"]
    ).unwrap();

    /// Writes refused by the sanity check
    pub static ref CACHE_REJECTIONS_TOTAL: CounterVec = register_counter_vec!(
        "rollup_cache_rejections_total",
        "Aggregates refused by the cache sanity check",
        &["reason"]
    ).unwrap();

    // === Health ===

    /// 1 once metrics are initialized
    pub static ref HEALTH_STATUS: Gauge = register_gauge!(
        "rollup_health_status",
        "Aggregator health (1 = up)"
    ).unwrap();
}

/// Initialize metrics system
pub fn init() {
    HEALTH_STATUS.set(1.0);
    tracing::info!("Metrics system initialized");
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record one page walk outcome (`success`, `throttled` or `error`)
#[inline]
pub fn record_remote_fetch(kind: &str, status: &str) {
    REMOTE_FETCHES_TOTAL.with_label_values(&[kind, status]).inc();
}

/// Record a throttling retry
#[inline]
pub fn record_retry(kind: &str) {
    FETCH_RETRIES_TOTAL.with_label_values(&[kind]).inc();
}

/// Record a bucket reported as zero after a failed fetch
#[inline]
pub fn record_fetch_failure(kind: &str, reason: &str) {
    FETCH_FAILURES_TOTAL.with_label_values(&[kind, reason]).inc();
}

/// Record a page-ceiling truncation
#[inline]
pub fn record_pagination_truncated(kind: &str) {
    PAGINATION_TRUNCATED_TOTAL.with_label_values(&[kind]).inc();
}

/// Observe page walk latency
#[inline]
pub fn observe_fetch_duration(kind: &str, duration_secs: f64) {
    FETCH_DURATION.with_label_values(&[kind]).observe(duration_secs);
}

/// Record a cache lookup
#[inline]
pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    CACHE_LOOKUPS_TOTAL.with_label_values(&[result]).inc();
}

/// Record a refused cache write
#[inline]
pub fn record_cache_rejection(reason: &str) {
    CACHE_REJECTIONS_TOTAL.with_label_values(&[reason]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init();
        assert_eq!(HEALTH_STATUS.get(), 1.0);
    }

    #[test]
    fn test_fetch_failures_are_exported() {
        record_fetch_failure("items", "remote_error");
        let metrics = gather_metrics().expect("Failed to gather metrics");
        assert!(metrics.contains("rollup_fetch_failures_total"));
    }

    #[test]
    fn test_cache_lookup_counts() {
        let before = CACHE_LOOKUPS_TOTAL.with_label_values(&["hit"]).get();
        record_cache_lookup(true);
        assert!(CACHE_LOOKUPS_TOTAL.with_label_values(&["hit"]).get() >= before + 1.0);
    }
}
