//! Persisted ingestion progress.
//!
//! Progress is stored as one JSON document per indexer and job kind under the
//! key `Indexer:State:<feed>`. Timestamps round-trip as RFC 3339 strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::FeedKind;

/// Job types whose progress is persisted independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Backfill,
    Upkeep,
}

impl JobKind {
    /// Field name inside the state-store hash for this job.
    pub fn field(&self) -> &'static str {
        match self {
            JobKind::Backfill => "backfill",
            JobKind::Upkeep => "upkeep",
        }
    }
}

/// State-store key for one indexer instance.
pub fn state_key(kind: FeedKind) -> String {
    format!("Indexer:State:{kind}")
}

#[derive(Debug, Error)]
#[error("invalid time range: start {start} is after end {end}")]
pub struct InvalidTimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Half-open historical interval, `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, InvalidTimeRange> {
        if start > end {
            return Err(InvalidTimeRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Snapshot of one backfill worker's assigned range and pagination cursor.
///
/// `continuation: None` always means "not started": finished workers report
/// no resumable progress and are structurally absent from snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerProgress {
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub continuation: Option<String>,
}

impl WorkerProgress {
    pub fn range(&self) -> Result<TimeRange, InvalidTimeRange> {
        TimeRange::new(self.start_timestamp, self.end_timestamp)
    }
}

/// Root persisted object per job type per feed kind. `workers` holds only
/// ranges that were unfinished at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerProgress {
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub workers: Vec<WorkerProgress>,
}

impl IndexerProgress {
    pub fn new(range: TimeRange, workers: Vec<WorkerProgress>) -> Self {
        Self {
            start_timestamp: range.start,
            end_timestamp: range.end,
            workers,
        }
    }

    /// Upkeep persists its moving watermark as a degenerate range.
    pub fn watermark(watermark: DateTime<Utc>) -> Self {
        Self {
            start_timestamp: watermark,
            end_timestamp: watermark,
            workers: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn time_range_rejects_reversed_bounds() {
        assert!(TimeRange::new(ts(10), ts(5)).is_err());
        assert!(TimeRange::new(ts(5), ts(5)).unwrap().is_empty());
    }

    #[test]
    fn progress_round_trips_through_json() {
        let progress = IndexerProgress::new(
            TimeRange::new(ts(1_700_000_000), ts(1_700_086_400)).unwrap(),
            vec![WorkerProgress {
                start_timestamp: ts(1_700_000_000),
                end_timestamp: ts(1_700_043_200),
                continuation: Some("abc123".to_string()),
            }],
        );
        let json = serde_json::to_string(&progress).unwrap();
        let restored: IndexerProgress = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, progress);
    }

    #[test]
    fn progress_uses_camel_case_fields() {
        let progress = IndexerProgress::watermark(ts(1_700_000_000));
        let value = serde_json::to_value(&progress).unwrap();
        assert!(value.get("startTimestamp").is_some());
        assert!(value.get("endTimestamp").is_some());
        assert_eq!(value["startTimestamp"], value["endTimestamp"]);
    }

    #[test]
    fn state_key_is_scoped_per_feed() {
        assert_eq!(state_key(FeedKind::Asks), "Indexer:State:asks");
        assert_eq!(JobKind::Backfill.field(), "backfill");
        assert_eq!(JobKind::Upkeep.field(), "upkeep");
    }
}
