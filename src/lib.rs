//! Metrics Rollup - hierarchical time-bucketed metrics aggregation
//!
//! This library answers "how many records, and what total/average value, in
//! this time window?" against a paginated remote record store:
//! - Windows are split into 5- or 15-minute buckets and summed
//! - Completed leaf buckets are cached and shared between overlapping requests
//! - Concurrent requests for the same bucket share one remote fetch
//! - Throttled fetches retry with exponential backoff
//! - Progress is reported bucket by bucket

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Remote record store interface and in-memory implementation
pub mod remote;

/// Paginated fetch with throttling retry
pub mod fetch;

/// Leaf cache variants and in-flight request deduplication
pub mod cache;

/// Bucket splitting, value extraction and hierarchical aggregation
pub mod aggregation;

// Re-export main types
pub use aggregation::{
    AggregatedMetricsData, AggregatorBuilder, BucketProgress, HierarchicalAggregator,
};
pub use cache::{AggregationCache, CacheStatsSnapshot, MemorySessionStorage, MetricsCache, SessionCache};
pub use config::Config;
pub use error::{Error, RemoteError, Result};
pub use fetch::{Sleeper, TokioSleeper};
pub use remote::{InMemoryRemote, PageQuery, RecordPage, RemoteQueryAdapter};
pub use types::{AggregationRequest, RawRecord, RecordCost, RecordKind, SubFilters, TimeWindow};
