//! In-memory remote adapter
//!
//! Serves records from memory with real cursor pagination. Used by tests and
//! the `rollup` binary; also records every query it receives and can be
//! scripted to fail the next N calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{PageQuery, RecordPage, RemoteQueryAdapter};
use crate::error::RemoteError;
use crate::types::{RawRecord, RecordKind};

/// Records keyed by (account, kind)
type RecordTable = HashMap<(String, RecordKind), Vec<RawRecord>>;

/// In-memory record store
pub struct InMemoryRemote {
    /// Stored records, sorted by timestamp per (account, kind)
    records: RwLock<RecordTable>,

    /// Page size cap applied on top of the query's limit
    page_size: Option<usize>,

    /// Artificial latency per call
    latency: Option<Duration>,

    /// Scripted outcomes for the next calls, in order; `None` passes through
    failures: Mutex<VecDeque<Option<RemoteError>>>,

    /// Every query received
    history: Mutex<Vec<PageQuery>>,

    /// Total calls
    calls: AtomicU64,
}

impl InMemoryRemote {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            page_size: None,
            latency: None,
            failures: Mutex::new(VecDeque::new()),
            history: Mutex::new(Vec::new()),
            calls: AtomicU64::new(0),
        }
    }

    /// Cap every page at `size` records
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size.max(1));
        self
    }

    /// Sleep for `latency` on every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Add records for an account and kind
    pub fn insert(&self, account_id: &str, kind: RecordKind, records: Vec<RawRecord>) {
        let mut table = self.records.write();
        let entry = table.entry((account_id.to_string(), kind)).or_default();
        entry.extend(records);
        entry.sort_by_key(|r| r.timestamp);
    }

    /// Fail the next call with `error`
    ///
    /// Calls queue up: scripting two errors fails the next two calls.
    pub fn fail_next(&self, error: RemoteError) {
        self.failures.lock().push_back(Some(error));
    }

    /// Let the next `n` calls through before any scripted failure
    pub fn pass_next(&self, n: usize) {
        let mut failures = self.failures.lock();
        for _ in 0..n {
            failures.push_back(None);
        }
    }

    /// Fail the next `n` calls with clones of `error`
    pub fn fail_next_n(&self, n: usize, error: RemoteError) {
        let mut failures = self.failures.lock();
        for _ in 0..n {
            failures.push_back(Some(error.clone()));
        }
    }

    /// Total calls received
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Queries received so far
    pub fn queries(&self) -> Vec<PageQuery> {
        self.history.lock().clone()
    }

    /// Forget recorded queries and reset the call counter
    pub fn reset_history(&self) {
        self.history.lock().clear();
        self.calls.store(0, Ordering::SeqCst);
    }

    fn parse_bound(raw: &str) -> Result<DateTime<Utc>, RemoteError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| RemoteError::message(format!("invalid timestamp '{}': {}", raw, e)))
    }

    fn page(&self, query: &PageQuery) -> Result<RecordPage, RemoteError> {
        let start = Self::parse_bound(&query.start)?;
        let end = Self::parse_bound(&query.end)?;
        let offset = match &query.next_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| RemoteError::message(format!("invalid nextToken '{}'", token)))?,
            None => 0,
        };

        let limit = query
            .limit
            .map(|l| l as usize)
            .unwrap_or(usize::MAX)
            .min(self.page_size.unwrap_or(usize::MAX))
            .max(1);

        let table = self.records.read();
        let Some(records) = table.get(&(query.account_id.clone(), query.kind)) else {
            return Ok(RecordPage::default());
        };

        let mut items = Vec::new();
        let mut matched = 0usize;
        let mut more = false;
        for record in records
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp < end)
            .filter(|r| query.filters.matches(r))
        {
            if matched >= offset {
                if items.len() == limit {
                    more = true;
                    break;
                }
                items.push(record.clone());
            }
            matched += 1;
        }

        let next_token = more.then(|| (offset + items.len()).to_string());
        Ok(RecordPage { items, next_token })
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteQueryAdapter for InMemoryRemote {
    async fn query_page(&self, query: &PageQuery) -> Result<RecordPage, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.history.lock().push(query.clone());

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(Some(error)) = self.failures.lock().pop_front() {
            return Err(error);
        }

        self.page(query)
    }
}
