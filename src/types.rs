//! Core data types used throughout the aggregator
//!
//! # Key Types
//!
//! - **`TimeWindow`**: Half-open UTC window `[start, end)`
//! - **`RecordKind`**: Closed set of record kinds the remote store serves
//! - **`SubFilters`**: Optional scorecard / score / subtype narrowing
//! - **`AggregationRequest`**: Immutable request handed to the aggregator
//! - **`RawRecord`**: One record as returned by the remote store
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use metrics_rollup::types::{AggregationRequest, RecordKind, SubFilters};
//!
//! let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
//! let end = Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap();
//!
//! let request = AggregationRequest::new("acct-1", RecordKind::ScoreResults, start, end)
//!     .unwrap()
//!     .with_filters(SubFilters::new().scorecard("sc-1"));
//! assert_eq!(request.interval_minutes(), 60);
//! ```

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Format a timestamp the way the remote service and cache keys expect
///
/// Millisecond precision with a `Z` suffix, e.g. `2024-05-01T10:00:00.000Z`.
pub fn to_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ============================================================================
// Time Window
// ============================================================================

/// Half-open time window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Start timestamp (inclusive)
    pub start: DateTime<Utc>,

    /// End timestamp (exclusive)
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Create a new window, rejecting `end < start`
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end < start {
            return Err(Error::InvalidRequest(format!(
                "window end {} is before start {}",
                to_iso(end),
                to_iso(start)
            )));
        }
        Ok(Self { start, end })
    }

    /// Window length
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// True for a zero-length window
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Check whether a timestamp falls inside `[start, end)`
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", to_iso(self.start), to_iso(self.end))
    }
}

// ============================================================================
// Record Kinds
// ============================================================================

/// How records of a kind contribute to `sum` and `avg`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRule {
    /// Every record contributes 1 (pure count)
    Count,

    /// The record's value is parsed ("Yes"/"No"/"85%"/"0.75")
    Score,
}

/// Kind of record served by the remote store
///
/// The set is closed: each kind fixes its value rule and whether cost
/// fields are folded into the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordKind {
    /// Evaluated items
    Items,

    /// Background tasks
    Tasks,

    /// Score results produced by scorecards
    ScoreResults,

    /// Human feedback on score results
    FeedbackItems,
}

impl RecordKind {
    /// All kinds, in a stable order
    pub const ALL: [RecordKind; 4] = [
        RecordKind::Items,
        RecordKind::Tasks,
        RecordKind::ScoreResults,
        RecordKind::FeedbackItems,
    ];

    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Items => "items",
            RecordKind::Tasks => "tasks",
            RecordKind::ScoreResults => "scoreResults",
            RecordKind::FeedbackItems => "feedbackItems",
        }
    }

    /// Value rule applied by the extractor
    pub fn value_rule(&self) -> ValueRule {
        match self {
            RecordKind::Items | RecordKind::Tasks => ValueRule::Count,
            RecordKind::ScoreResults | RecordKind::FeedbackItems => ValueRule::Score,
        }
    }

    /// Whether cost / decision / error fields are folded for this kind
    pub fn tracks_cost(&self) -> bool {
        matches!(self, RecordKind::ScoreResults)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        RecordKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidRequest(format!("unknown record kind '{}'", s)))
    }
}

// ============================================================================
// Sub-filters
// ============================================================================

/// Optional narrowing applied on top of account + kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubFilters {
    /// Scorecard identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scorecard_id: Option<String>,

    /// Score identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_id: Option<String>,

    /// Record subtype (e.g. `prediction`, `evaluation`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
}

impl SubFilters {
    /// No filtering
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one scorecard
    pub fn scorecard(mut self, id: impl Into<String>) -> Self {
        self.scorecard_id = Some(id.into());
        self
    }

    /// Restrict to one score
    pub fn score(mut self, id: impl Into<String>) -> Self {
        self.score_id = Some(id.into());
        self
    }

    /// Restrict to one record subtype
    pub fn subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    /// Check whether a record passes every set filter
    pub fn matches(&self, record: &RawRecord) -> bool {
        fn ok(filter: &Option<String>, value: &Option<String>) -> bool {
            match filter {
                Some(f) => value.as_deref() == Some(f.as_str()),
                None => true,
            }
        }
        ok(&self.scorecard_id, &record.scorecard_id)
            && ok(&self.score_id, &record.score_id)
            && ok(&self.subtype, &record.subtype)
    }
}

// ============================================================================
// Aggregation Request
// ============================================================================

/// Request for aggregated metrics over a window
///
/// Immutable once constructed; builders consume and return `self`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationRequest {
    account_id: String,
    kind: RecordKind,
    window: TimeWindow,
    filters: SubFilters,
}

impl AggregationRequest {
    /// Create a request; fails when `end < start`
    pub fn new(
        account_id: impl Into<String>,
        kind: RecordKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self> {
        let account_id = account_id.into();
        if account_id.is_empty() {
            return Err(Error::InvalidRequest("account id is empty".to_string()));
        }
        Ok(Self {
            account_id,
            kind,
            window: TimeWindow::new(start, end)?,
            filters: SubFilters::default(),
        })
    }

    /// Attach sub-filters
    pub fn with_filters(mut self, filters: SubFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Account identifier
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Record kind
    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Requested window
    pub fn window(&self) -> TimeWindow {
        self.window
    }

    /// Sub-filters
    pub fn filters(&self) -> &SubFilters {
        &self.filters
    }

    /// Same account, kind and filters over a different window
    ///
    /// Used for sub-buckets, whose windows come from the splitter and are
    /// always well-formed.
    pub fn for_window(&self, window: TimeWindow) -> Self {
        Self {
            account_id: self.account_id.clone(),
            kind: self.kind,
            window,
            filters: self.filters.clone(),
        }
    }

    /// Window length in whole minutes (informational)
    pub fn interval_minutes(&self) -> i64 {
        self.window.duration().num_minutes()
    }
}

// ============================================================================
// Raw Records
// ============================================================================

/// Cost information attached to score results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordCost {
    /// Total cost in USD
    #[serde(default)]
    pub total_cost: f64,

    /// Calls that went to an external AI API
    #[serde(default)]
    pub external_ai_api_calls: u64,

    /// Calls served from the AI response cache
    #[serde(default)]
    pub cached_ai_api_calls: u64,
}

/// A record as returned by the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    /// Record identifier
    pub id: String,

    /// Creation / update timestamp the store indexes on
    pub timestamp: DateTime<Utc>,

    /// Scorecard the record belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scorecard_id: Option<String>,

    /// Score the record belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_id: Option<String>,

    /// Record subtype
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,

    /// Raw value (string, number, boolean or null)
    #[serde(default)]
    pub value: Option<serde_json::Value>,

    /// Cost information (score results only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<RecordCost>,

    /// Whether producing the record failed
    #[serde(default)]
    pub is_error: bool,
}

impl RawRecord {
    /// Create a record with no value
    pub fn new(id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            timestamp,
            scorecard_id: None,
            score_id: None,
            subtype: None,
            value: None,
            cost: None,
            is_error: false,
        }
    }

    /// Set the raw value
    pub fn with_value(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Attach cost information
    pub fn with_cost(mut self, cost: RecordCost) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Set scorecard / score identifiers
    pub fn with_score(mut self, scorecard_id: impl Into<String>, score_id: impl Into<String>) -> Self {
        self.scorecard_id = Some(scorecard_id.into());
        self.score_id = Some(score_id.into());
        self
    }

    /// Set subtype
    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    /// Mark the record as failed
    pub fn failed(mut self) -> Self {
        self.is_error = true;
        self
    }
}
