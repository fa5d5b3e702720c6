//! Remote query adapter
//!
//! The record store is an external, paginated query service keyed by
//! account, record kind and time range. The aggregator only sees it through
//! [`RemoteQueryAdapter`], which returns one page of raw records per call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::types::{RawRecord, RecordKind, SubFilters};

mod memory;

pub use memory::InMemoryRemote;

/// One page request against the remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    /// Account identifier
    pub account_id: String,

    /// Record kind
    pub kind: RecordKind,

    /// Window start, ISO-8601 (inclusive)
    pub start: String,

    /// Window end, ISO-8601 (exclusive)
    pub end: String,

    /// Sub-filters
    #[serde(default)]
    pub filters: SubFilters,

    /// Continuation cursor from the previous page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,

    /// Maximum records per page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// One page of results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPage {
    /// Records in this page
    pub items: Vec<RawRecord>,

    /// Cursor for the next page, `None` when exhausted
    #[serde(default)]
    pub next_token: Option<String>,
}

/// Paginated record source
///
/// Implementations may fail transiently; throttling is classified and
/// retried by the caller.
#[async_trait]
pub trait RemoteQueryAdapter: Send + Sync {
    /// Fetch one page of records
    async fn query_page(&self, query: &PageQuery) -> Result<RecordPage, RemoteError>;
}
