pub mod loki;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub use loki::LokiClient;

#[derive(Debug, Error)]
pub enum SourceError {
    /// Transport failures or server errors that outlasted the retry budget
    #[error("log source unavailable after {attempts} attempts: {message}")]
    Unavailable { attempts: u32, message: String },

    #[error("log source rejected query with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("failed to decode log source response: {0}")]
    Decode(String),

    #[error("window {0} is outside the representable nanosecond range")]
    WindowOutOfRange(TimeWindow),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Nanoseconds since the Unix epoch, the resolution of the log store's API
pub fn to_nanos(ts: DateTime<Utc>) -> Option<i64> {
    ts.timestamp_nanos_opt()
}

pub fn from_nanos(nanos: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(
        nanos.div_euclid(1_000_000_000),
        nanos.rem_euclid(1_000_000_000) as u32,
    )
}

/// Half-open time interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Returns None unless `start < end`
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
            self.end.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,
    pub line: String,
}

/// Records returned for one window, sorted by timestamp ascending
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordBatch {
    pub records: Vec<LogRecord>,
    /// Number of records the store sent, before any client-side filtering
    pub returned: usize,
}

impl RecordBatch {
    pub fn new(records: Vec<LogRecord>) -> Self {
        let returned = records.len();
        Self::with_returned(records, returned)
    }

    pub fn with_returned(mut records: Vec<LogRecord>, returned: usize) -> Self {
        // Stable, so records sharing a timestamp keep the store's order
        records.sort_by_key(|r| r.timestamp);
        Self {
            returned: returned.max(records.len()),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Fetches up to `limit` records matching `query` inside `window`.
///
/// A result of exactly `limit` records is returned unchanged: deciding whether
/// it was truncated is up to the caller.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn fetch(
        &self,
        query: &str,
        window: TimeWindow,
        limit: usize,
    ) -> Result<RecordBatch, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(secs: i64, line: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            labels: BTreeMap::new(),
            line: line.to_string(),
        }
    }

    #[test]
    fn test_window_requires_start_before_end() {
        let t = Utc.with_ymd_and_hms(2020, 2, 23, 0, 0, 0).unwrap();
        assert!(TimeWindow::new(t, t).is_none());
        assert!(TimeWindow::new(t + chrono::Duration::seconds(1), t).is_none());

        let window = TimeWindow::new(t, t + chrono::Duration::seconds(1)).unwrap();
        assert!(window.contains(t));
        assert!(!window.contains(window.end));
    }

    #[test]
    fn test_nanos_conversion() {
        let ts = Utc.with_ymd_and_hms(2020, 2, 23, 0, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(123);
        let nanos = to_nanos(ts).unwrap();
        assert_eq!(nanos, 1_582_416_000_000_000_123);
        assert_eq!(from_nanos(nanos), Some(ts));
        assert_eq!(from_nanos(-1), Some(Utc.timestamp_opt(-1, 999_999_999).unwrap()));
    }

    #[test]
    fn test_batch_sorts_stably() {
        let batch = RecordBatch::new(vec![
            record(3, "c"),
            record(1, "a1"),
            record(2, "b"),
            record(1, "a2"),
        ]);
        let lines: Vec<&str> = batch.records.iter().map(|r| r.line.as_str()).collect();
        assert_eq!(lines, vec!["a1", "a2", "b", "c"]);
    }
}
