//! Historical backfill: day-partitioned ranges drained by a bounded pool.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use chrono::{DateTime, Utc};
use core_types::{
    FeedKind, IndexerProgress, InvalidTimeRange, JobKind, TimeRange, WorkerProgress, state_key,
};
use log::{error, info, warn};
use order_store::OrderStore;
use parking_lot::Mutex;
use reservoir_source::{OrderFeed, PageQuery};
use state_store::StateStore;
use tokio::sync::Semaphore;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;

use crate::stats::{WorkerStats, WorkerStatsSnapshot};
use crate::{ACTIVE_STATUS, IndexerConfig, IndexerError, partition::partition_days};

/// Drains one bounded time range of a feed via cursor pagination.
///
/// A worker runs to exhaustion exactly once; only an absent continuation
/// token ends the loop. Errors are counted and the same cursor is retried.
pub struct BackfillWorker {
    range: TimeRange,
    page_limit: usize,
    continuation: Mutex<Option<String>>,
    running: AtomicBool,
    done: AtomicBool,
    stats: WorkerStats,
}

impl BackfillWorker {
    pub fn new(range: TimeRange, page_limit: usize) -> Self {
        Self {
            range,
            page_limit,
            continuation: Mutex::new(None),
            running: AtomicBool::new(false),
            done: AtomicBool::new(false),
            stats: WorkerStats::new(),
        }
    }

    /// Rebuild a worker from persisted progress, cursor carried verbatim.
    pub fn restore(progress: &WorkerProgress, page_limit: usize) -> Result<Self, InvalidTimeRange> {
        let worker = Self::new(progress.range()?, page_limit);
        *worker.continuation.lock() = progress.continuation.clone();
        Ok(worker)
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Resumable progress; absent once the range is fully drained, so a
    /// restored `continuation: None` always means "not started".
    pub fn progress(&self) -> Option<WorkerProgress> {
        if self.is_done() {
            return None;
        }
        Some(WorkerProgress {
            start_timestamp: self.range.start,
            end_timestamp: self.range.end,
            continuation: self.continuation.lock().clone(),
        })
    }

    pub(crate) async fn run(
        &self,
        feed: &dyn OrderFeed,
        store: &dyn OrderStore,
        cancel: &CancellationToken,
    ) {
        let kind = feed.kind();
        self.running.store(true, Ordering::Relaxed);
        loop {
            if cancel.is_cancelled() {
                // Leave the cursor where it is; the next run resumes here.
                self.running.store(false, Ordering::Relaxed);
                return;
            }
            let query = PageQuery {
                start_timestamp: Some(self.range.start.timestamp()),
                end_timestamp: Some(self.range.end.timestamp()),
                continuation: self.continuation.lock().clone(),
                limit: self.page_limit,
                status: Some(ACTIVE_STATUS.to_string()),
            };
            let page = match feed.fetch_page(&query).await {
                Ok(page) => page,
                Err(err) => {
                    self.stats.inc_errors();
                    warn!(
                        "[{kind}] backfill page failed for {}..{}: {err}",
                        self.range.start, self.range.end
                    );
                    continue;
                }
            };
            self.stats.inc_requests();
            let records = feed.extract(&page);
            self.stats.add_fetched(records.len() as u64);
            let batch_len = records.len() as u64;
            if let Err(err) = store.save_bulk(kind, records).await {
                self.stats.inc_errors();
                warn!(
                    "[{kind}] backfill commit failed for {}..{}: {err}",
                    self.range.start, self.range.end
                );
                continue;
            }
            self.stats.add_committed(batch_len);
            let next = feed.continuation(&page);
            let exhausted = next.is_none();
            *self.continuation.lock() = next;
            if exhausted {
                break;
            }
        }
        self.done.store(true, Ordering::Relaxed);
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Partitions history, owns the worker set, and persists aggregate progress.
pub struct BackfillCoordinator {
    config: IndexerConfig,
    feed: Arc<dyn OrderFeed>,
    store: Arc<dyn OrderStore>,
    state: Arc<dyn StateStore>,
    bounds: Mutex<Option<TimeRange>>,
    workers: Mutex<Vec<Arc<BackfillWorker>>>,
}

impl BackfillCoordinator {
    pub fn new(
        config: IndexerConfig,
        feed: Arc<dyn OrderFeed>,
        store: Arc<dyn OrderStore>,
        state: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            config,
            feed,
            store,
            state,
            bounds: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn bounds(&self) -> Option<TimeRange> {
        *self.bounds.lock()
    }

    pub fn workers(&self) -> Vec<Arc<BackfillWorker>> {
        self.workers.lock().clone()
    }

    /// Drain all of history, resuming persisted progress when present.
    /// Returns the end-of-history watermark handed off to upkeep.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<DateTime<Utc>, IndexerError> {
        let kind = self.feed.kind();
        let (range, workers) = match self.load_saved(kind).await {
            Some(saved) => {
                let range = TimeRange::new(saved.start_timestamp, saved.end_timestamp)?;
                let workers = saved
                    .workers
                    .iter()
                    .map(|progress| {
                        BackfillWorker::restore(progress, self.config.page_limit).map(Arc::new)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                info!(
                    "[{kind}] restored backfill state: {} unfinished range(s)",
                    workers.len()
                );
                (range, workers)
            }
            None => {
                let now = Utc::now();
                let start = self.discover_history_start(cancel).await?.unwrap_or(now);
                let range = TimeRange::new(start.min(now), now)?;
                let workers: Vec<_> = partition_days(range)
                    .into_iter()
                    .map(|day| Arc::new(BackfillWorker::new(day, self.config.page_limit)))
                    .collect();
                info!(
                    "[{kind}] backfilling {} day range(s) from {} to {}",
                    workers.len(),
                    range.start,
                    range.end
                );
                (range, workers)
            }
        };
        *self.bounds.lock() = Some(range);
        *self.workers.lock() = workers.clone();

        self.persist_logged(kind, range, &workers).await;
        if workers.is_empty() {
            return Ok(range.end);
        }

        let snapshot_cancel = cancel.child_token();
        let snapshot_guard = snapshot_cancel.clone().drop_guard();
        let snapshot_task = {
            let state = Arc::clone(&self.state);
            let workers = workers.clone();
            let period = self.config.snapshot_interval;
            tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = snapshot_cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(err) =
                                persist_progress(state.as_ref(), kind, range, &workers).await
                            {
                                error!("[{kind}] failed to persist backfill state: {err}");
                            }
                        }
                    }
                }
            })
        };

        let semaphore = Arc::new(Semaphore::new(self.config.pool_size));
        let mut handles = Vec::with_capacity(workers.len());
        for worker in &workers {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.unwrap(),
            };
            let worker = Arc::clone(worker);
            let feed = Arc::clone(&self.feed);
            let store = Arc::clone(&self.store);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                worker.run(feed.as_ref(), store.as_ref(), &cancel).await;
            }));
        }
        for handle in handles {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!("[{kind}] backfill worker task failed: {err}");
                }
            }
        }

        drop(snapshot_guard);
        let _ = snapshot_task.await;
        // Final snapshot: finished workers have dropped out of the capture.
        self.persist_logged(kind, range, &workers).await;

        let done = workers.iter().filter(|w| w.is_done()).count();
        info!(
            "[{kind}] backfill finished: {done}/{} range(s) drained",
            workers.len()
        );
        Ok(range.end)
    }

    async fn load_saved(&self, kind: FeedKind) -> Option<IndexerProgress> {
        let value = match self
            .state
            .get(&state_key(kind), JobKind::Backfill.field())
            .await
        {
            Ok(value) => value?,
            Err(err) => {
                warn!("[{kind}] unreadable backfill state, starting fresh: {err}");
                return None;
            }
        };
        match serde_json::from_value(value) {
            Ok(progress) => Some(progress),
            Err(err) => {
                warn!("[{kind}] malformed backfill state, starting fresh: {err}");
                None
            }
        }
    }

    /// Find the `updatedAt` of the single oldest active record, or `None` on
    /// an empty feed. Failure here aborts startup; there is no partial state
    /// worth resuming from yet.
    async fn discover_history_start(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<DateTime<Utc>>, IndexerError> {
        let kind = self.feed.kind();
        let query = PageQuery {
            limit: 1,
            status: Some(ACTIVE_STATUS.to_string()),
            ..Default::default()
        };
        let mut attempt = 0usize;
        loop {
            match self.feed.fetch_page(&query).await {
                Ok(page) => {
                    let oldest = self.feed.extract(&page).into_iter().next();
                    return Ok(oldest.map(|order| order.updated_at));
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.config.startup_fetch_attempts || cancel.is_cancelled() {
                        return Err(err.into());
                    }
                    warn!("[{kind}] history probe failed (attempt {attempt}): {err}");
                    let delay =
                        self.config.startup_retry_delay * 2u32.saturating_pow(attempt as u32 - 1);
                    sleep(delay).await;
                }
            }
        }
    }

    async fn persist_logged(
        &self,
        kind: FeedKind,
        range: TimeRange,
        workers: &[Arc<BackfillWorker>],
    ) {
        if let Err(err) = persist_progress(self.state.as_ref(), kind, range, workers).await {
            error!("[{kind}] failed to persist backfill state: {err}");
        }
    }
}

async fn persist_progress(
    state: &dyn StateStore,
    kind: FeedKind,
    range: TimeRange,
    workers: &[Arc<BackfillWorker>],
) -> Result<(), IndexerError> {
    let progress = IndexerProgress::new(
        range,
        workers.iter().filter_map(|worker| worker.progress()).collect(),
    );
    state
        .set(
            &state_key(kind),
            JobKind::Backfill.field(),
            serde_json::to_value(&progress)?,
        )
        .await?;
    Ok(())
}
