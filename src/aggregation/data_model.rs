//! Aggregated metrics data model
//!
//! `AggregatedMetricsData` is additive across buckets: counts and sums add,
//! and `avg` is always recomputed from the combined `sum` and `valid_count`.

use serde::{Deserialize, Serialize};
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use super::value::extract;
use crate::types::{RawRecord, RecordKind};

/// Aggregate over one or more buckets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedMetricsData {
    /// Number of records
    pub count: u64,

    /// Sum of valid numeric values
    pub sum: f64,

    /// `sum / valid_count`, 0 when nothing was valid
    pub avg: f64,

    /// Records whose value was numeric (the `avg` denominator)
    pub valid_count: u64,

    /// Total cost in USD
    #[serde(default)]
    pub cost: f64,

    /// Records that carried a decision
    #[serde(default)]
    pub decision_count: u64,

    /// Calls made to an external AI API
    #[serde(default)]
    pub external_ai_api_count: u64,

    /// Calls served from the AI response cache
    #[serde(default)]
    pub cached_ai_api_count: u64,

    /// Records that failed
    #[serde(default)]
    pub error_count: u64,
}

impl AggregatedMetricsData {
    /// Zero-valued aggregate
    ///
    /// Also what a failed fetch degrades to.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Fold raw records of `kind` into an aggregate
    pub fn from_records(kind: RecordKind, records: &[RawRecord]) -> Self {
        let mut data = Self::zero();
        for record in records {
            data.add_record(kind, record);
        }
        data.recompute_avg();
        data
    }

    /// Add a single record
    ///
    /// Leaves `avg` stale; callers finish with `recompute_avg`.
    fn add_record(&mut self, kind: RecordKind, record: &RawRecord) {
        self.count += 1;

        let extracted = extract(kind, record);
        if let (true, Some(value)) = (extracted.is_valid, extracted.value) {
            self.sum += value;
            self.valid_count += 1;
        }

        if kind.tracks_cost() {
            if extracted.is_valid {
                self.decision_count += 1;
            }
            if let Some(cost) = &record.cost {
                self.cost += cost.total_cost;
                self.external_ai_api_count += cost.external_ai_api_calls;
                self.cached_ai_api_count += cost.cached_ai_api_calls;
            }
            if record.is_error {
                self.error_count += 1;
            }
        }
    }

    fn recompute_avg(&mut self) {
        self.avg = if self.valid_count == 0 {
            0.0
        } else {
            self.sum / self.valid_count as f64
        };
    }

    /// Merge another aggregate into this one
    pub fn merge(&mut self, other: &AggregatedMetricsData) {
        self.count += other.count;
        self.sum += other.sum;
        self.valid_count += other.valid_count;
        self.cost += other.cost;
        self.decision_count += other.decision_count;
        self.external_ai_api_count += other.external_ai_api_count;
        self.cached_ai_api_count += other.cached_ai_api_count;
        self.error_count += other.error_count;
        self.recompute_avg();
    }

    /// True if nothing was counted
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl AddAssign<&AggregatedMetricsData> for AggregatedMetricsData {
    fn add_assign(&mut self, rhs: &AggregatedMetricsData) {
        self.merge(rhs);
    }
}

impl Add for AggregatedMetricsData {
    type Output = AggregatedMetricsData;

    fn add(mut self, rhs: AggregatedMetricsData) -> Self::Output {
        self.merge(&rhs);
        self
    }
}

impl<'a> Sum<&'a AggregatedMetricsData> for AggregatedMetricsData {
    fn sum<I: Iterator<Item = &'a AggregatedMetricsData>>(iter: I) -> Self {
        iter.fold(Self::zero(), |mut acc, x| {
            acc += x;
            acc
        })
    }
}
