//! Perpetual tail polling past the point backfill reached.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use order_store::OrderStore;
use parking_lot::Mutex;
use reservoir_source::{OrderFeed, PageQuery};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::stats::{WorkerStats, WorkerStatsSnapshot};

/// Polls the live tail of a feed from a moving watermark, forever.
pub struct UpkeepWorker {
    watermark: Mutex<DateTime<Utc>>,
    page_limit: usize,
    idle_delay: Duration,
    stats: WorkerStats,
}

impl UpkeepWorker {
    pub fn new(start: DateTime<Utc>, page_limit: usize, idle_delay: Duration) -> Self {
        Self {
            watermark: Mutex::new(start),
            page_limit,
            idle_delay,
            stats: WorkerStats::new(),
        }
    }

    pub fn watermark(&self) -> DateTime<Utc> {
        *self.watermark.lock()
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Runs until cancelled; this is the process's steady-state behavior for
    /// one feed kind.
    pub async fn run(
        &self,
        feed: &dyn OrderFeed,
        store: &dyn OrderStore,
        cancel: &CancellationToken,
    ) {
        info!("[{}] upkeep polling from {}", feed.kind(), self.watermark());
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let caught_up = self.drain(feed, store, cancel).await;
            if cancel.is_cancelled() {
                return;
            }
            if caught_up {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(self.idle_delay) => {}
                }
            }
        }
    }

    /// One poll iteration: drain the backlog past the watermark, chaining the
    /// continuation only within this iteration. Returns true when the tail
    /// looked caught up (last page under the limit).
    async fn drain(
        &self,
        feed: &dyn OrderFeed,
        store: &dyn OrderStore,
        cancel: &CancellationToken,
    ) -> bool {
        let kind = feed.kind();
        // Continuation tokens are tied to the query they started from, so the
        // lower bound is pinned for the whole drain even as the watermark moves.
        let start = self.watermark().timestamp();
        let mut continuation: Option<String> = None;
        let mut last_batch;
        loop {
            if cancel.is_cancelled() {
                return true;
            }
            let query = PageQuery {
                start_timestamp: Some(start),
                end_timestamp: None,
                continuation: continuation.clone(),
                limit: self.page_limit,
                status: None,
            };
            let page = match feed.fetch_page(&query).await {
                Ok(page) => page,
                Err(err) => {
                    self.stats.inc_errors();
                    warn!("[{kind}] upkeep poll failed: {err}");
                    // TODO: back off between failed tail polls instead of
                    // retrying immediately
                    if continuation.is_none() {
                        return true;
                    }
                    continue;
                }
            };
            self.stats.inc_requests();
            let records = feed.extract(&page);
            self.stats.add_fetched(records.len() as u64);
            last_batch = records.len();
            if !records.is_empty() {
                // Pages arrive ascending by update time, but the live tail can
                // still carry a few out-of-order stragglers; re-polling from
                // the earliest update seen trades duplicate work (absorbed by
                // idempotent upserts) for not missing them.
                let earliest = records.iter().map(|r| r.updated_at).min();
                let batch_len = records.len() as u64;
                match store.save_bulk(kind, records).await {
                    Ok(()) => {
                        self.stats.add_committed(batch_len);
                        if let Some(earliest) = earliest {
                            *self.watermark.lock() = earliest;
                        }
                    }
                    Err(err) => {
                        self.stats.inc_errors();
                        warn!("[{kind}] upkeep commit failed: {err}");
                        continue;
                    }
                }
            }
            continuation = feed.continuation(&page);
            if continuation.is_none() {
                return last_batch < self.page_limit;
            }
        }
    }
}
