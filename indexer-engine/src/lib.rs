//! Core ingestion engine.
//!
//! One [`OrderIndexer`] per feed kind sequences two jobs: a crash-resumable
//! historical backfill over day-partitioned ranges, then a perpetual upkeep
//! poll that follows the live tail from the watermark backfill handed off.
//! The low-latency stream path is a separate engine; this one guarantees
//! completeness, not freshness.

pub mod backfill;
pub mod partition;
pub mod stats;
pub mod upkeep;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use core_types::{FeedKind, IndexerProgress, JobKind, TimeRange, state_key};
use log::{error, warn};
use order_store::{OrderStore, OrderStoreError};
use parking_lot::Mutex;
use reservoir_source::{OrderFeed, SourceError};
use state_store::{StateStore, StateStoreError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

pub use backfill::{BackfillCoordinator, BackfillWorker};
pub use stats::{WorkerStats, WorkerStatsSnapshot};
pub use upkeep::UpkeepWorker;

pub(crate) const ACTIVE_STATUS: &str = "active";

const DEFAULT_POOL_SIZE: usize = 6;
const DEFAULT_PAGE_LIMIT: usize = 1000;
const DEFAULT_SNAPSHOT_SECS: u64 = 5;
const DEFAULT_IDLE_SECS: u64 = 15;
const DEFAULT_STARTUP_ATTEMPTS: usize = 3;
const DEFAULT_STARTUP_RETRY_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("state store error: {0}")]
    State(#[from] StateStoreError),
    #[error("order store error: {0}")]
    Store(#[from] OrderStoreError),
    #[error("state serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    InvalidRange(#[from] core_types::InvalidTimeRange),
}

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub pool_size: usize,
    pub page_limit: usize,
    pub snapshot_interval: Duration,
    pub idle_delay: Duration,
    pub startup_fetch_attempts: usize,
    pub startup_retry_delay: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            page_limit: DEFAULT_PAGE_LIMIT,
            snapshot_interval: Duration::from_secs(DEFAULT_SNAPSHOT_SECS),
            idle_delay: Duration::from_secs(DEFAULT_IDLE_SECS),
            startup_fetch_attempts: DEFAULT_STARTUP_ATTEMPTS,
            startup_retry_delay: Duration::from_millis(DEFAULT_STARTUP_RETRY_MS),
        }
    }
}

impl IndexerConfig {
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit.clamp(1, 1000);
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    pub fn with_idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = delay;
        self
    }
}

/// Lifecycle phase exposed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerPhase {
    Starting,
    Backfilling,
    Upkeep,
}

#[derive(Debug, Clone)]
pub struct BackfillWorkerSnapshot {
    pub range: TimeRange,
    pub running: bool,
    pub done: bool,
    pub stats: WorkerStatsSnapshot,
}

#[derive(Debug, Clone)]
pub struct UpkeepSnapshot {
    pub watermark: DateTime<Utc>,
    pub stats: WorkerStatsSnapshot,
}

/// Point-in-time view of one indexer for the dashboard.
#[derive(Debug, Clone)]
pub struct IndexerStatusSnapshot {
    pub feed: FeedKind,
    pub phase: IndexerPhase,
    pub backfill: Vec<BackfillWorkerSnapshot>,
    pub upkeep: Option<UpkeepSnapshot>,
}

/// Per-feed composition root: one backfill coordinator, one upkeep worker,
/// sequenced backfill-first so the two never race on the same history.
pub struct OrderIndexer {
    config: IndexerConfig,
    feed: Arc<dyn OrderFeed>,
    store: Arc<dyn OrderStore>,
    state: Arc<dyn StateStore>,
    coordinator: BackfillCoordinator,
    upkeep: Mutex<Option<Arc<UpkeepWorker>>>,
}

impl OrderIndexer {
    pub fn new(
        config: IndexerConfig,
        feed: Arc<dyn OrderFeed>,
        store: Arc<dyn OrderStore>,
        state: Arc<dyn StateStore>,
    ) -> Self {
        let coordinator = BackfillCoordinator::new(
            config.clone(),
            Arc::clone(&feed),
            Arc::clone(&store),
            Arc::clone(&state),
        );
        Self {
            config,
            feed,
            store,
            state,
            coordinator,
            upkeep: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> FeedKind {
        self.feed.kind()
    }

    /// Spawn the indexer onto the runtime. The caller decides whether an
    /// error (only possible during startup) aborts the process.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<Result<(), IndexerError>> {
        tokio::spawn(async move {
            let result = self.run(cancel).await;
            if let Err(err) = &result {
                error!("[{}] indexer failed: {err}", self.kind());
            }
            result
        })
    }

    /// Backfill to the present, then follow the tail until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), IndexerError> {
        let kind = self.kind();
        let handoff = self.coordinator.run(&cancel).await?;
        if cancel.is_cancelled() {
            return Ok(());
        }

        let start = self.load_upkeep_watermark().await.unwrap_or(handoff);
        let upkeep = Arc::new(UpkeepWorker::new(
            start,
            self.config.page_limit,
            self.config.idle_delay,
        ));
        *self.upkeep.lock() = Some(Arc::clone(&upkeep));

        let snapshot_cancel = cancel.child_token();
        let snapshot_guard = snapshot_cancel.clone().drop_guard();
        let snapshot_task = {
            let state = Arc::clone(&self.state);
            let worker = Arc::clone(&upkeep);
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
                                persist_upkeep(state.as_ref(), kind, worker.watermark()).await
                            {
                                error!("[{kind}] failed to persist upkeep state: {err}");
                            }
                        }
                    }
                }
            })
        };

        upkeep
            .run(self.feed.as_ref(), self.store.as_ref(), &cancel)
            .await;
        drop(snapshot_guard);
        let _ = snapshot_task.await;
        Ok(())
    }

    async fn load_upkeep_watermark(&self) -> Option<DateTime<Utc>> {
        let kind = self.kind();
        let value = match self
            .state
            .get(&state_key(kind), JobKind::Upkeep.field())
            .await
        {
            Ok(value) => value?,
            Err(err) => {
                warn!("[{kind}] unreadable upkeep state, using backfill hand-off: {err}");
                return None;
            }
        };
        match serde_json::from_value::<IndexerProgress>(value) {
            Ok(progress) => Some(progress.start_timestamp),
            Err(err) => {
                warn!("[{kind}] malformed upkeep state, using backfill hand-off: {err}");
                None
            }
        }
    }

    pub fn status(&self) -> IndexerStatusSnapshot {
        let backfill: Vec<BackfillWorkerSnapshot> = self
            .coordinator
            .workers()
            .iter()
            .map(|worker| BackfillWorkerSnapshot {
                range: worker.range(),
                running: worker.is_running(),
                done: worker.is_done(),
                stats: worker.stats(),
            })
            .collect();
        let upkeep = self.upkeep.lock().as_ref().map(|worker| UpkeepSnapshot {
            watermark: worker.watermark(),
            stats: worker.stats(),
        });
        let phase = if upkeep.is_some() {
            IndexerPhase::Upkeep
        } else if backfill.is_empty() {
            IndexerPhase::Starting
        } else {
            IndexerPhase::Backfilling
        };
        IndexerStatusSnapshot {
            feed: self.kind(),
            phase,
            backfill,
            upkeep,
        }
    }
}

async fn persist_upkeep(
    state: &dyn StateStore,
    kind: FeedKind,
    watermark: DateTime<Utc>,
) -> Result<(), IndexerError> {
    let progress = IndexerProgress::watermark(watermark);
    state
        .set(
            &state_key(kind),
            JobKind::Upkeep.field(),
            serde_json::to_value(&progress)?,
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ScriptedFeed, page, raw_order, ts};
    use order_store::MemoryOrderStore;
    use state_store::MemoryStateStore;

    #[tokio::test(start_paused = true)]
    async fn indexer_hands_off_to_upkeep_and_prefers_saved_watermark() {
        let kind = FeedKind::Bids;
        let saved_watermark = ts("2023-11-06T12:00:00Z");
        let state = Arc::new(MemoryStateStore::new());
        state
            .set(
                &state_key(kind),
                JobKind::Upkeep.field(),
                serde_json::to_value(IndexerProgress::watermark(saved_watermark)).unwrap(),
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let feed = Arc::new(ScriptedFeed::new(kind).cancel_after(3, cancel.clone()));
        // Empty feed: backfill completes immediately with watermark = now,
        // which the saved upkeep watermark then overrides.
        feed.script(None, None, Ok(page(vec![], None)));
        feed.script(
            Some(saved_watermark.timestamp()),
            None,
            Ok(page(vec![raw_order("b1", ts("2023-11-06T13:00:00Z"))], None)),
        );
        feed.script_fallback(Ok(page(vec![], None)));

        let store = Arc::new(MemoryOrderStore::new());
        let indexer = OrderIndexer::new(
            IndexerConfig::default(),
            Arc::clone(&feed) as Arc<dyn OrderFeed>,
            Arc::clone(&store) as Arc<dyn OrderStore>,
            Arc::clone(&state) as Arc<dyn StateStore>,
        );

        indexer.run(cancel).await.unwrap();

        let status = indexer.status();
        assert_eq!(status.phase, IndexerPhase::Upkeep);
        let upkeep = status.upkeep.unwrap();
        assert_eq!(upkeep.watermark, ts("2023-11-06T13:00:00Z"));
        assert_eq!(store.ids(kind), vec!["b1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn upkeep_state_is_a_degenerate_range_at_the_watermark() {
        let kind = FeedKind::Bids;
        let state = Arc::new(MemoryStateStore::new());
        let watermark = ts("2023-11-06T12:00:00Z");
        persist_upkeep(state.as_ref(), kind, watermark).await.unwrap();

        let value = state
            .get(&state_key(kind), JobKind::Upkeep.field())
            .await
            .unwrap()
            .unwrap();
        let progress: IndexerProgress = serde_json::from_value(value).unwrap();
        assert_eq!(progress.start_timestamp, watermark);
        assert_eq!(progress.end_timestamp, watermark);
        assert!(progress.workers.is_empty());
    }
}
