use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

#[derive(Default)]
struct StreamMetricsInner {
    connected: AtomicBool,
    messages: AtomicU64,
    asks_upserted: AtomicU64,
    bids_upserted: AtomicU64,
    dropped: AtomicU64,
    parse_errors: AtomicU64,
    store_errors: AtomicU64,
    reconnects: AtomicU64,
    last_message_ms: AtomicI64,
    last_published_ms: AtomicI64,
    backoff_ms: AtomicU64,
}

/// Shared counters describing the stream connection, read by the dashboard.
#[derive(Clone, Default)]
pub struct StreamMetrics {
    inner: Arc<StreamMetricsInner>,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamMetricsSnapshot {
    pub connected: bool,
    pub messages: u64,
    pub asks_upserted: u64,
    pub bids_upserted: u64,
    pub dropped: u64,
    pub parse_errors: u64,
    pub store_errors: u64,
    pub reconnects: u64,
    /// Epoch milliseconds of the last received frame, if any.
    pub last_message_ms: Option<i64>,
    /// Highest `published_at` observed across all frames, if any.
    pub last_published_ms: Option<i64>,
    pub backoff_ms: u64,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::Relaxed);
    }

    pub fn inc_messages(&self) {
        self.inner.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_asks_upserted(&self) {
        self.inner.asks_upserted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bids_upserted(&self) {
        self.inner.bids_upserted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped(&self) {
        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_parse_errors(&self) {
        self.inner.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_store_errors(&self) {
        self.inner.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reconnects(&self) {
        self.inner.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_message(&self) {
        self.inner
            .last_message_ms
            .store(now_ms(), Ordering::Relaxed);
    }

    /// Keeps the highest published-at timestamp seen so far.
    pub fn observe_published(&self, published_ms: i64) {
        self.inner
            .last_published_ms
            .fetch_max(published_ms, Ordering::Relaxed);
    }

    pub fn set_backoff_ms(&self, backoff_ms: u64) {
        self.inner.backoff_ms.store(backoff_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StreamMetricsSnapshot {
        let last_message_ms = self.inner.last_message_ms.load(Ordering::Relaxed);
        let last_published_ms = self.inner.last_published_ms.load(Ordering::Relaxed);
        StreamMetricsSnapshot {
            connected: self.inner.connected.load(Ordering::Relaxed),
            messages: self.inner.messages.load(Ordering::Relaxed),
            asks_upserted: self.inner.asks_upserted.load(Ordering::Relaxed),
            bids_upserted: self.inner.bids_upserted.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            parse_errors: self.inner.parse_errors.load(Ordering::Relaxed),
            store_errors: self.inner.store_errors.load(Ordering::Relaxed),
            reconnects: self.inner.reconnects.load(Ordering::Relaxed),
            last_message_ms: (last_message_ms > 0).then_some(last_message_ms),
            last_published_ms: (last_published_ms > 0).then_some(last_published_ms),
            backoff_ms: self.inner.backoff_ms.load(Ordering::Relaxed),
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_timestamp_is_monotonic() {
        let metrics = StreamMetrics::new();
        metrics.observe_published(1_700_000_000_500);
        metrics.observe_published(1_700_000_000_100);
        assert_eq!(
            metrics.snapshot().last_published_ms,
            Some(1_700_000_000_500)
        );
    }

    #[test]
    fn snapshot_hides_timestamps_that_never_fired() {
        let snapshot = StreamMetrics::new().snapshot();
        assert_eq!(snapshot.last_message_ms, None);
        assert_eq!(snapshot.last_published_ms, None);
    }
}
