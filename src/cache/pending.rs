//! In-flight request deduplication
//!
//! At most one computation per cache key runs at a time. The first caller
//! for a key becomes the leader and spawns the computation onto the runtime;
//! callers arriving while it runs await the same shared handle instead of
//! issuing their own remote fetch. The spawned task owns the work, so
//! dropping any caller, the leader included, neither cancels it nor frees
//! the key early: the entry is removed by the task itself once it is done.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

use super::CacheKey;
use crate::aggregation::AggregatedMetricsData;

type SharedComputation = Shared<BoxFuture<'static, AggregatedMetricsData>>;

/// Map of in-flight computations keyed like the cache
#[derive(Default)]
pub struct PendingRequests {
    in_flight: Arc<DashMap<CacheKey, SharedComputation>>,
    joined: AtomicU64,
}

impl PendingRequests {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `compute` for `key` unless a computation for it is already running
    ///
    /// `compute` is only invoked by the leader and its future runs to
    /// completion on a spawned task even if every caller goes away.
    /// Followers get a clone of the result. Must be called from within a
    /// tokio runtime.
    pub async fn run<F>(&self, key: CacheKey, compute: F) -> AggregatedMetricsData
    where
        F: FnOnce() -> BoxFuture<'static, AggregatedMetricsData>,
    {
        // Check-then-insert happens under the shard lock
        let computation = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                self.joined.fetch_add(1, Ordering::Relaxed);
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let work = compute();
                let map = Arc::clone(&self.in_flight);
                let task_key = key;

                // The task's remove() waits on this shard until insert() below releases it
                let handle = tokio::spawn(async move {
                    let data = work.await;
                    map.remove(&task_key);
                    data
                });

                let computation = handle
                    .map(|joined| match joined {
                        Ok(data) => data,
                        Err(e) => {
                            error!(error = %e, "In-flight computation failed, reporting zero");
                            AggregatedMetricsData::zero()
                        }
                    })
                    .boxed()
                    .shared();
                entry.insert(computation.clone());
                computation
            }
        };

        computation.await
    }

    /// Number of computations currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Callers that joined an existing computation instead of starting one
    pub fn joined(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AggregationRequest, RecordKind};
    use chrono::{Duration, TimeZone, Utc};
    use std::time::Duration as StdDuration;

    fn key() -> CacheKey {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let request =
            AggregationRequest::new("acct", RecordKind::Items, start, start + Duration::minutes(5))
                .unwrap();
        CacheKey::for_request(&request)
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let pending = PendingRequests::new();
        let started = Arc::new(AtomicU64::new(0));

        let make = |started: Arc<AtomicU64>| {
            move || {
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(StdDuration::from_millis(20)).await;
                    AggregatedMetricsData {
                        count: 7,
                        ..Default::default()
                    }
                }
                .boxed()
            }
        };

        let (a, b) = tokio::join!(
            pending.run(key(), make(started.clone())),
            pending.run(key(), make(started.clone())),
        );

        assert_eq!(a.count, 7);
        assert_eq!(b.count, 7);
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(pending.joined(), 1);
        assert_eq!(pending.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_sequential_callers_each_compute() {
        let pending = PendingRequests::new();
        let first = pending
            .run(key(), || async { AggregatedMetricsData::zero() }.boxed())
            .await;
        let second = pending
            .run(key(), || {
                async {
                    AggregatedMetricsData {
                        count: 1,
                        ..Default::default()
                    }
                }
                .boxed()
            })
            .await;

        assert_eq!(first.count, 0);
        assert_eq!(second.count, 1);
        assert_eq!(pending.joined(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_leader_still_completes() {
        let pending = PendingRequests::new();
        let finished = Arc::new(AtomicU64::new(0));

        let done = finished.clone();
        let abandoned = tokio::time::timeout(
            StdDuration::from_millis(10),
            pending.run(key(), move || {
                async move {
                    tokio::time::sleep(StdDuration::from_millis(50)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    AggregatedMetricsData::zero()
                }
                .boxed()
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(pending.in_flight(), 1);

        tokio::time::sleep(StdDuration::from_millis(150)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(pending.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dropped_leader_keeps_key_claimed() {
        let pending = Arc::new(PendingRequests::new());
        let started = Arc::new(AtomicU64::new(0));

        let compute = |started: Arc<AtomicU64>| {
            move || {
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(StdDuration::from_millis(100)).await;
                    AggregatedMetricsData {
                        count: 3,
                        ..Default::default()
                    }
                }
                .boxed()
            }
        };

        let leader = {
            let pending = pending.clone();
            let compute = compute(started.clone());
            tokio::spawn(async move { pending.run(key(), compute).await })
        };
        tokio::time::sleep(StdDuration::from_millis(5)).await;

        let follower = {
            let pending = pending.clone();
            let compute = compute(started.clone());
            tokio::spawn(async move { pending.run(key(), compute).await })
        };
        tokio::time::sleep(StdDuration::from_millis(15)).await;

        leader.abort();
        tokio::time::sleep(StdDuration::from_millis(10)).await;

        let late = pending.run(key(), compute(started.clone())).await;
        assert_eq!(late.count, 3);
        assert_eq!(follower.await.unwrap().count, 3);
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(pending.joined(), 2);
    }
}
