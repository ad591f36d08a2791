//! Shared types for the reef orderbook ingestion system.

pub mod state;
pub mod types;

pub use state::{IndexerProgress, InvalidTimeRange, JobKind, TimeRange, WorkerProgress, state_key};
pub use types::{FeedKind, OrderRecord, OrderScope, OrderSide};
