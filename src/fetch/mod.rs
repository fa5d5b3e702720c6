//! Retrying fetch-and-aggregate
//!
//! Walks every page of a bucket's records, folding each page into an
//! aggregate as it arrives. Throttled walks are retried from the first page
//! with exponential backoff; a non-throttling error or exhausted retries
//! degrade to a zero aggregate. [`RetryingFetcher::fetch_and_aggregate`]
//! never fails.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::aggregation::AggregatedMetricsData;
use crate::config::{Config, PaginationConfig};
use crate::error::RemoteError;
use crate::metrics;
use crate::remote::{PageQuery, RemoteQueryAdapter};
use crate::types::{to_iso, AggregationRequest};

mod retry;

pub use retry::{is_throttling_error, RetryPolicy, Sleeper, TokioSleeper};

/// Outcome of one complete page walk
struct PageWalk {
    data: AggregatedMetricsData,
    pages: u32,
    truncated: bool,
}

/// Fetches and folds a bucket's records with retry
pub struct RetryingFetcher {
    remote: Arc<dyn RemoteQueryAdapter>,
    policy: RetryPolicy,
    pagination: PaginationConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryingFetcher {
    /// Create a fetcher
    pub fn new(
        remote: Arc<dyn RemoteQueryAdapter>,
        policy: RetryPolicy,
        pagination: PaginationConfig,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            remote,
            policy,
            pagination,
            sleeper,
        }
    }

    /// Create a fetcher from the `[retry]` and `[pagination]` sections
    pub fn from_config(
        remote: Arc<dyn RemoteQueryAdapter>,
        config: &Config,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self::new(
            remote,
            RetryPolicy::from_config(&config.retry),
            config.pagination.clone(),
            sleeper,
        )
    }

    /// Retry policy in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetch every record in the request's window and aggregate them
    ///
    /// Returns a zero aggregate when the remote store fails with a
    /// non-throttling error or keeps throttling past the retry budget.
    pub async fn fetch_and_aggregate(&self, request: &AggregationRequest) -> AggregatedMetricsData {
        self.fetch(request).await.unwrap_or_default()
    }

    /// Like [`fetch_and_aggregate`](Self::fetch_and_aggregate) but hands back
    /// the final error so callers can tell a failure from an empty window
    pub async fn fetch(
        &self,
        request: &AggregationRequest,
    ) -> Result<AggregatedMetricsData, RemoteError> {
        let kind = request.kind();
        let window = request.window();
        let mut attempt = 0;

        loop {
            let started = Instant::now();
            let result = self.walk_pages(request).await;
            metrics::observe_fetch_duration(kind.as_str(), started.elapsed().as_secs_f64());

            let err = match result {
                Ok(walk) => {
                    metrics::record_remote_fetch(kind.as_str(), "success");
                    if walk.truncated {
                        metrics::record_pagination_truncated(kind.as_str());
                    }
                    debug!(
                        kind = %kind,
                        window = %window,
                        pages = walk.pages,
                        count = walk.data.count,
                        attempts = attempt + 1,
                        "Fetched bucket"
                    );
                    return Ok(walk.data);
                }
                Err(err) => err,
            };

            let throttled = is_throttling_error(&err);
            metrics::record_remote_fetch(
                kind.as_str(),
                if throttled { "throttled" } else { "error" },
            );

            if throttled && self.policy.should_retry(attempt) {
                let delay = self.policy.delay_for_attempt(attempt);
                metrics::record_retry(kind.as_str());
                warn!(
                    kind = %kind,
                    window = %window,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Remote store throttled, retrying: {}",
                    err
                );
                self.sleeper.sleep(delay).await;
                attempt += 1;
                continue;
            }

            if throttled {
                warn!(
                    kind = %kind,
                    window = %window,
                    attempts = attempt + 1,
                    "Giving up after repeated throttling, reporting zero: {}",
                    err
                );
                metrics::record_fetch_failure(kind.as_str(), "retries_exhausted");
            } else {
                error!(
                    kind = %kind,
                    window = %window,
                    "Remote query failed, reporting zero: {}",
                    err
                );
                metrics::record_fetch_failure(kind.as_str(), "remote_error");
            }
            return Err(err);
        }
    }

    /// Follow cursors from the first page until exhausted or capped
    async fn walk_pages(&self, request: &AggregationRequest) -> Result<PageWalk, RemoteError> {
        let window = request.window();
        let mut query = PageQuery {
            account_id: request.account_id().to_string(),
            kind: request.kind(),
            start: to_iso(window.start),
            end: to_iso(window.end),
            filters: request.filters().clone(),
            next_token: None,
            limit: Some(self.pagination.page_limit),
        };

        let mut data = AggregatedMetricsData::zero();
        let mut pages = 0u32;

        loop {
            let page = self.remote.query_page(&query).await?;
            pages += 1;
            data.merge(&AggregatedMetricsData::from_records(
                request.kind(),
                &page.items,
            ));

            let Some(token) = page.next_token else {
                return Ok(PageWalk {
                    data,
                    pages,
                    truncated: false,
                });
            };

            if pages >= self.pagination.max_pages {
                warn!(
                    kind = %request.kind(),
                    window = %window,
                    pages,
                    count = data.count,
                    "Page ceiling reached, result truncated"
                );
                return Ok(PageWalk {
                    data,
                    pages,
                    truncated: true,
                });
            }

            let delay: Duration = self.pagination.page_delay();
            self.sleeper.sleep(delay).await;
            query.next_token = Some(token);
        }
    }
}
