//! Hierarchical aggregator
//!
//! Answers an [`AggregationRequest`] by splitting its window into buckets,
//! recursing until each leaf is at or below the direct threshold, and
//! summing the leaves. Only leaves touch the cache; parent windows are
//! always recomputed from their children, so overlapping requests reuse
//! each other's leaves.
//!
//! # Example
//!
//! ```rust,ignore
//! use metrics_rollup::{AggregatorBuilder, InMemoryRemote};
//!
//! let aggregator = AggregatorBuilder::new()
//!     .with_remote(InMemoryRemote::new())
//!     .build()?;
//!
//! let totals = aggregator.get_aggregated_metrics(&request).await;
//! ```

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::bucket::BucketSplitter;
use super::data_model::AggregatedMetricsData;
use crate::cache::{AggregationCache, CacheKey, CacheStatsSnapshot, MetricsCache, PendingRequests};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetch::{RetryingFetcher, Sleeper, TokioSleeper};
use crate::remote::RemoteQueryAdapter;
use crate::types::{AggregationRequest, TimeWindow};

// ============================================================================
// Progress
// ============================================================================

/// Progress report emitted after each top-level bucket completes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketProgress {
    /// Bucket start (inclusive)
    pub bucket_start: DateTime<Utc>,
    /// Bucket end (exclusive)
    pub bucket_end: DateTime<Utc>,
    /// Aggregate for this bucket alone
    pub bucket_metrics: AggregatedMetricsData,
    /// Aggregate of every bucket completed so far, this one included
    pub running_total: AggregatedMetricsData,
    /// Zero-based position of this bucket
    pub bucket_index: usize,
    /// Number of top-level buckets in the request
    pub total_buckets: usize,
}

// ============================================================================
// Statistics
// ============================================================================

/// Statistics for aggregation operations
#[derive(Debug, Default)]
pub struct AggregatorStats {
    /// Top-level requests answered
    pub queries: AtomicU64,

    /// Leaf buckets resolved (cache hits included)
    pub leaves: AtomicU64,

    /// Leaves that reached the remote store
    pub remote_fetches: AtomicU64,

    /// Leaves whose fetch failed and contributed zero
    pub failed_leaves: AtomicU64,

    /// Leaves computed but left uncached because they were still in progress
    pub in_progress_leaves: AtomicU64,
}

impl AggregatorStats {
    /// Get a snapshot of current statistics
    pub fn snapshot(&self) -> AggregatorStatsSnapshot {
        AggregatorStatsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            leaves: self.leaves.load(Ordering::Relaxed),
            remote_fetches: self.remote_fetches.load(Ordering::Relaxed),
            failed_leaves: self.failed_leaves.load(Ordering::Relaxed),
            in_progress_leaves: self.in_progress_leaves.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of aggregator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStatsSnapshot {
    /// Top-level requests answered
    pub queries: u64,
    /// Leaf buckets resolved
    pub leaves: u64,
    /// Leaves fetched remotely
    pub remote_fetches: u64,
    /// Leaves that failed
    pub failed_leaves: u64,
    /// Leaves not cached because still in progress
    pub in_progress_leaves: u64,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for a [`HierarchicalAggregator`]
pub struct AggregatorBuilder {
    remote: Option<Arc<dyn RemoteQueryAdapter>>,
    cache: Option<Arc<dyn MetricsCache>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    config: Config,
}

impl AggregatorBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            remote: None,
            cache: None,
            sleeper: None,
            config: Config::default(),
        }
    }

    /// Set the remote store adapter
    pub fn with_remote<R>(mut self, remote: R) -> Self
    where
        R: RemoteQueryAdapter + 'static,
    {
        self.remote = Some(Arc::new(remote));
        self
    }

    /// Set the remote store adapter from an existing Arc
    ///
    /// Use this when the caller keeps a handle on the adapter (e.g. to
    /// inspect the queries it received).
    pub fn with_remote_arc(mut self, remote: Arc<dyn RemoteQueryAdapter>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Use a specific cache instead of the in-memory default
    pub fn with_cache(mut self, cache: Arc<dyn MetricsCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the tokio timer used for backoff and page delays
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    /// Set configuration
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Build the aggregator
    pub fn build(self) -> Result<HierarchicalAggregator> {
        self.config.validate()?;

        let remote = self
            .remote
            .ok_or_else(|| Error::Configuration("No remote adapter configured".to_string()))?;

        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(AggregationCache::from_config(&self.config.cache)));

        if self.config.cache.clear_on_start {
            cache.clear();
        }

        let sleeper = self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper));
        let fetcher = RetryingFetcher::from_config(remote, &self.config, sleeper);

        info!(
            direct_threshold_minutes = self.config.splitter.direct_threshold_minutes,
            max_retries = self.config.retry.max_retries,
            max_pages = self.config.pagination.max_pages,
            "Aggregator initialized"
        );

        Ok(HierarchicalAggregator {
            inner: Arc::new(Inner {
                splitter: BucketSplitter::new(&self.config.splitter),
                fetcher,
                cache,
                pending: PendingRequests::new(),
                stats: AggregatorStats::default(),
            }),
        })
    }
}

impl Default for AggregatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Aggregator
// ============================================================================

/// State shared with in-flight leaf computations
struct Inner {
    splitter: BucketSplitter,
    fetcher: RetryingFetcher,
    cache: Arc<dyn MetricsCache>,
    pending: PendingRequests,
    stats: AggregatorStats,
}

/// Time-bucketed metrics aggregator
///
/// Cheap to clone; clones share the cache and the in-flight map.
#[derive(Clone)]
pub struct HierarchicalAggregator {
    inner: Arc<Inner>,
}

impl HierarchicalAggregator {
    /// Start building an aggregator
    pub fn builder() -> AggregatorBuilder {
        AggregatorBuilder::new()
    }

    /// Aggregate every record in the request's window
    ///
    /// Never fails: buckets whose fetch fails contribute zero.
    pub async fn get_aggregated_metrics(
        &self,
        request: &AggregationRequest,
    ) -> AggregatedMetricsData {
        self.get_aggregated_metrics_with_progress(request, |_| {})
            .await
    }

    /// Aggregate the request's window, reporting each top-level bucket
    ///
    /// `on_progress` runs once per top-level bucket, in window order. A
    /// window at or below the direct threshold counts as one bucket; a
    /// zero-length window reports nothing.
    pub async fn get_aggregated_metrics_with_progress<F>(
        &self,
        request: &AggregationRequest,
        mut on_progress: F,
    ) -> AggregatedMetricsData
    where
        F: FnMut(&BucketProgress),
    {
        self.inner.stats.queries.fetch_add(1, Ordering::Relaxed);

        let buckets = self.inner.splitter.split(&request.window());
        let total_buckets = buckets.len();
        debug!(
            account = request.account_id(),
            kind = %request.kind(),
            window = %request.window(),
            buckets = total_buckets,
            "Aggregating request"
        );

        let mut running_total = AggregatedMetricsData::zero();
        for (bucket_index, bucket) in buckets.into_iter().enumerate() {
            let child = request.for_window(bucket.window);
            let bucket_metrics = Inner::aggregate_window(self.inner.clone(), child).await;
            running_total.merge(&bucket_metrics);

            on_progress(&BucketProgress {
                bucket_start: bucket.window.start,
                bucket_end: bucket.window.end,
                bucket_metrics,
                running_total: running_total.clone(),
                bucket_index,
                total_buckets,
            });
        }

        running_total
    }

    /// Drop every cached leaf
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Cache size, keys and counters
    pub fn get_cache_stats(&self) -> CacheStatsSnapshot {
        self.inner.cache.stats()
    }

    /// Aggregator statistics
    pub fn stats(&self) -> AggregatorStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Leaf computations currently running
    pub fn in_flight(&self) -> usize {
        self.inner.pending.in_flight()
    }
}

impl Inner {
    /// Aggregate any window: fetch it if it is a leaf, otherwise recurse
    fn aggregate_window(
        inner: Arc<Inner>,
        request: AggregationRequest,
    ) -> BoxFuture<'static, AggregatedMetricsData> {
        async move {
            let window = request.window();
            if window.is_empty() {
                return AggregatedMetricsData::zero();
            }
            if inner.splitter.is_direct(&window) {
                return Self::aggregate_leaf(inner, request).await;
            }

            let mut total = AggregatedMetricsData::zero();
            for bucket in inner.splitter.split(&window) {
                let child = request.for_window(bucket.window);
                total += &Self::aggregate_window(inner.clone(), child).await;
            }
            total
        }
        .boxed()
    }

    /// Resolve a leaf from the cache, an in-flight computation or the remote store
    async fn aggregate_leaf(inner: Arc<Inner>, request: AggregationRequest) -> AggregatedMetricsData {
        inner.stats.leaves.fetch_add(1, Ordering::Relaxed);

        let key = CacheKey::for_request(&request);
        if let Some(cached) = inner.cache.get(&key) {
            return cached;
        }

        let computation = {
            let inner = inner.clone();
            let key = key.clone();
            move || Self::compute_leaf(inner, key, request).boxed()
        };
        inner.pending.run(key, computation).await
    }

    /// Fetch a leaf and cache it when complete and successful
    ///
    /// Runs as the sole computation for `key`. A caller that missed the
    /// cache just before a previous computation stored its result and left
    /// the pending map lands here, so the cache is checked once more first.
    async fn compute_leaf(
        inner: Arc<Inner>,
        key: CacheKey,
        request: AggregationRequest,
    ) -> AggregatedMetricsData {
        if let Some(cached) = inner.cache.peek(&key) {
            return cached;
        }

        inner.stats.remote_fetches.fetch_add(1, Ordering::Relaxed);

        let data = match inner.fetcher.fetch(&request).await {
            Ok(data) => data,
            Err(_) => {
                inner.stats.failed_leaves.fetch_add(1, Ordering::Relaxed);
                return AggregatedMetricsData::zero();
            }
        };

        if is_in_progress(&request.window(), Utc::now()) {
            inner.stats.in_progress_leaves.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Leaf still in progress, not caching");
        } else {
            inner.cache.set(&key, &data);
        }
        data
    }
}

/// A bucket ending after `now` may still gain records
fn is_in_progress(window: &TimeWindow, now: DateTime<Utc>) -> bool {
    window.end > now
}
