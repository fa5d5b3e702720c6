//! Bucket splitting
//!
//! Decomposes an arbitrary `[start, end)` window into an ordered, gap-free,
//! non-overlapping list of sub-buckets:
//!
//! ```text
//!   duration <= 15m        one Direct bucket
//!   duration <= 29m        5-minute buckets
//!   otherwise              15-minute buckets
//! ```
//!
//! Sub-bucket boundaries start at the request's own start time and step by
//! the bucket size; the last bucket is clipped to `end`. Boundaries are NOT
//! aligned to wall-clock quarter hours, so two requests only share cache
//! entries when their starts agree modulo the bucket size.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::SplitterConfig;
use crate::types::TimeWindow;

// ============================================================================
// Bucket Size
// ============================================================================

/// Size class of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BucketSize {
    /// 60-minute bucket
    SixtyMinutes,
    /// 30-minute bucket
    ThirtyMinutes,
    /// 15-minute bucket
    FifteenMinutes,
    /// 5-minute bucket
    FiveMinutes,
    /// 1-minute bucket
    OneMinute,
    /// Leaf window fetched as-is
    Direct,
}

impl BucketSize {
    /// Map a minute count onto a size class
    ///
    /// Sizes outside the ladder are treated as direct.
    pub fn from_minutes(minutes: u32) -> Self {
        match minutes {
            60 => BucketSize::SixtyMinutes,
            30 => BucketSize::ThirtyMinutes,
            15 => BucketSize::FifteenMinutes,
            5 => BucketSize::FiveMinutes,
            1 => BucketSize::OneMinute,
            _ => BucketSize::Direct,
        }
    }

    /// Nominal length, `None` for direct buckets
    pub fn minutes(&self) -> Option<u32> {
        match self {
            BucketSize::SixtyMinutes => Some(60),
            BucketSize::ThirtyMinutes => Some(30),
            BucketSize::FifteenMinutes => Some(15),
            BucketSize::FiveMinutes => Some(5),
            BucketSize::OneMinute => Some(1),
            BucketSize::Direct => None,
        }
    }
}

impl fmt::Display for BucketSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.minutes() {
            Some(m) => write!(f, "{}m", m),
            None => f.write_str("direct"),
        }
    }
}

/// A window plus the size class it was cut with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bucket {
    /// Covered window
    pub window: TimeWindow,

    /// Size class
    pub size: BucketSize,
}

impl Bucket {
    /// Length of the bucket
    pub fn duration(&self) -> Duration {
        self.window.duration()
    }
}

// ============================================================================
// Bucket Iterator
// ============================================================================

/// Iterator over consecutive `step`-sized windows clipped to an end time
struct BucketIterator {
    current: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
    step: Duration,
    size: BucketSize,
}

impl Iterator for BucketIterator {
    type Item = Bucket;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.end {
            return None;
        }

        let start = self.current;
        let end = (start + self.step).min(self.end);
        self.current = end;

        Some(Bucket {
            window: TimeWindow { start, end },
            size: self.size,
        })
    }
}

// ============================================================================
// Bucket Splitter
// ============================================================================

/// Decomposes windows according to the configured bucket ladder
#[derive(Debug, Clone)]
pub struct BucketSplitter {
    direct_threshold: Duration,
    fine_split_max: Duration,
    fine_bucket_minutes: u32,
    coarse_bucket_minutes: u32,
}

impl Default for BucketSplitter {
    fn default() -> Self {
        Self::new(&SplitterConfig::default())
    }
}

impl BucketSplitter {
    /// Create a splitter from configuration
    pub fn new(config: &SplitterConfig) -> Self {
        Self {
            direct_threshold: Duration::minutes(i64::from(config.direct_threshold_minutes)),
            fine_split_max: Duration::minutes(i64::from(config.fine_split_max_minutes)),
            fine_bucket_minutes: config.fine_bucket_minutes.max(1),
            coarse_bucket_minutes: config.coarse_bucket_minutes.max(1),
        }
    }

    /// Windows up to this length are aggregated directly
    pub fn direct_threshold(&self) -> Duration {
        self.direct_threshold
    }

    /// True if `window` is a leaf that gets fetched instead of split
    pub fn is_direct(&self, window: &TimeWindow) -> bool {
        window.duration() <= self.direct_threshold
    }

    /// Bucket size that `window` would be split into
    pub fn bucket_size_for(&self, window: &TimeWindow) -> BucketSize {
        let duration = window.duration();
        if duration <= self.direct_threshold {
            BucketSize::Direct
        } else if duration <= self.fine_split_max {
            BucketSize::from_minutes(self.fine_bucket_minutes)
        } else {
            BucketSize::from_minutes(self.coarse_bucket_minutes)
        }
    }

    /// Split `window` into ordered sub-buckets
    ///
    /// A zero-length window yields no buckets; a window at or below the
    /// direct threshold yields a single direct bucket.
    pub fn split(&self, window: &TimeWindow) -> Vec<Bucket> {
        if window.is_empty() {
            return Vec::new();
        }

        let duration = window.duration();
        if duration <= self.direct_threshold {
            return vec![Bucket {
                window: *window,
                size: BucketSize::Direct,
            }];
        }

        let step_minutes = if duration <= self.fine_split_max {
            self.fine_bucket_minutes
        } else {
            self.coarse_bucket_minutes
        };

        BucketIterator {
            current: window.start,
            end: window.end,
            step: Duration::minutes(i64::from(step_minutes)),
            size: BucketSize::from_minutes(step_minutes),
        }
        .collect()
    }
}
