//! Hierarchical time-bucketed aggregation
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │       Aggregation Request           │
//! │  account + kind + filters + window  │
//! └─────────────────────────────────────┘
//!                  ↓
//! ┌─────────────────────────────────────┐
//! │         Bucket Splitter             │
//! │   direct / 5m / 15m sub-buckets     │
//! └─────────────────────────────────────┘
//!                  ↓
//! ┌─────────────────────────────────────┐
//! │      Leaf Cache + In-Flight Map     │
//! │  one remote fetch per bucket key    │
//! └─────────────────────────────────────┘
//!                  ↓
//! ┌─────────────────────────────────────┐
//! │   Retrying Paginated Fetch + Fold   │
//! │   value extraction per record       │
//! └─────────────────────────────────────┘
//! ```
//!
//! # Key Components
//!
//! - **Bucket Splitter**: decomposes a window into request-start-aligned buckets
//! - **Value Extractor**: turns a raw record into a numeric contribution
//! - **Aggregated Metrics**: additive totals with `avg` recomputed from `sum`
//! - **Hierarchical Aggregator**: recursion, leaf caching and progress reports

pub mod bucket;
pub mod data_model;
pub mod hierarchical;
pub mod value;

pub use bucket::{Bucket, BucketSize, BucketSplitter};
pub use data_model::AggregatedMetricsData;
pub use hierarchical::{
    AggregatorBuilder, AggregatorStats, AggregatorStatsSnapshot, BucketProgress,
    HierarchicalAggregator,
};
pub use value::{extract, parse_score, ExtractedValue};
