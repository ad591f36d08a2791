use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

#[derive(Default)]
struct WorkerStatsInner {
    fetched: AtomicU64,
    committed: AtomicU64,
    requests: AtomicU64,
    errors: AtomicU64,
}

/// Cumulative counters shared between a worker and its observers.
#[derive(Clone, Default)]
pub struct WorkerStats {
    inner: Arc<WorkerStatsInner>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    pub fetched: u64,
    pub committed: u64,
    pub requests: u64,
    pub errors: u64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_fetched(&self, delta: u64) {
        if delta > 0 {
            self.inner.fetched.fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub fn add_committed(&self, delta: u64) {
        if delta > 0 {
            self.inner.committed.fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub fn inc_requests(&self) {
        self.inner.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            fetched: self.inner.fetched.load(Ordering::Relaxed),
            committed: self.inner.committed.load(Ordering::Relaxed),
            requests: self.inner.requests.load(Ordering::Relaxed),
            errors: self.inner.errors.load(Ordering::Relaxed),
        }
    }
}
