//! Lazy window planning for one exporter run.
//!
//! The log store silently caps every query at `limit` records and offers no
//! continuation cursor, so a page that comes back full may be hiding records.
//! The planner splits the run into UTC days and probes each one; a full page
//! splits the window in two and both halves are probed again, earlier half
//! first. Each probe's batch is the window's data, so an accepted window is
//! never fetched twice.

use crate::source::{LogSource, RecordBatch, SourceError, TimeWindow};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use tracing::debug;

/// Upper bound of one run: `min(now, resume + max_days)`, optionally held off
/// to `midnight(now) - holdoff_days` so only complete days are exported.
///
/// `max_days == 0` means no day bound.
pub fn run_ceiling(
    resume: DateTime<Utc>,
    now: DateTime<Utc>,
    max_days: u32,
    holdoff_days: Option<u32>,
) -> DateTime<Utc> {
    let mut ceiling = now;

    if max_days > 0 {
        if let Some(bound) = resume.checked_add_signed(Duration::days(i64::from(max_days))) {
            ceiling = ceiling.min(bound);
        }
    }

    if let Some(days) = holdoff_days {
        let today = midnight(now);
        if let Some(bound) = today.checked_sub_signed(Duration::days(i64::from(days))) {
            ceiling = ceiling.min(bound);
        }
    }

    ceiling
}

fn midnight(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Split `[start, end)` at every UTC midnight in between
pub fn day_windows(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<TimeWindow> {
    let mut windows = Vec::new();
    let mut cursor = start;

    while cursor < end {
        let next_day = midnight(cursor)
            .checked_add_signed(Duration::days(1))
            .unwrap_or(end);
        let boundary = next_day.min(end);
        if let Some(window) = TimeWindow::new(cursor, boundary) {
            windows.push(window);
        }
        cursor = boundary;
    }

    windows
}

/// Split a window at `start + floor(len / 2)`.
///
/// Returns None when the window is a single nanosecond and cannot be split.
pub fn bisect(window: &TimeWindow) -> Option<(TimeWindow, TimeWindow)> {
    let len = window.duration().num_nanoseconds().unwrap_or(i64::MAX);
    let mid = window.start + Duration::nanoseconds(len / 2);
    Some((
        TimeWindow::new(window.start, mid)?,
        TimeWindow::new(mid, window.end)?,
    ))
}

#[derive(Debug, Clone, Copy)]
pub struct PlanLimits {
    /// The store's per-query cap; a page this size is suspected truncated
    pub max_records: usize,
    /// Windows this short are never split further
    pub min_window: Duration,
}

/// A window the planner settled on, with the records already fetched for it
#[derive(Debug, Clone)]
pub struct PlannedWindow {
    pub window: TimeWindow,
    pub batch: RecordBatch,
    /// Still a full page at the minimum granularity: records may be missing
    pub irreducible: bool,
}

#[derive(Debug)]
pub struct WindowPlan {
    query: String,
    limits: PlanLimits,
    // Next window to probe is at the end
    pending: Vec<TimeWindow>,
    probes: u64,
    bisections: u64,
}

impl WindowPlan {
    /// An empty plan when `resume >= ceiling`
    pub fn new(
        query: impl Into<String>,
        resume: DateTime<Utc>,
        ceiling: DateTime<Utc>,
        limits: PlanLimits,
    ) -> Self {
        let mut pending = day_windows(resume, ceiling);
        pending.reverse();

        Self {
            query: query.into(),
            limits,
            pending,
            probes: 0,
            bisections: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// The window the next probe will fetch
    pub fn peek(&self) -> Option<TimeWindow> {
        self.pending.last().copied()
    }

    pub fn probes(&self) -> u64 {
        self.probes
    }

    pub fn bisections(&self) -> u64 {
        self.bisections
    }

    /// Probe until the next window is settled, or return None when the plan is done.
    ///
    /// On error the failed window stays pending.
    pub async fn next(
        &mut self,
        source: &dyn LogSource,
    ) -> Result<Option<PlannedWindow>, SourceError> {
        while let Some(window) = self.pending.pop() {
            let batch = match source
                .fetch(&self.query, window, self.limits.max_records)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    self.pending.push(window);
                    return Err(e);
                }
            };
            self.probes += 1;

            // Judge by what the store sent, not what survived filtering
            if batch.returned < self.limits.max_records {
                return Ok(Some(PlannedWindow {
                    window,
                    batch,
                    irreducible: false,
                }));
            }

            let halves = if window.duration() <= self.limits.min_window {
                None
            } else {
                bisect(&window)
            };

            match halves {
                Some((earlier, later)) => {
                    debug!(
                        query = %self.query,
                        window = %window,
                        returned = batch.returned,
                        "Full page, bisecting window"
                    );
                    self.bisections += 1;
                    self.pending.push(later);
                    self.pending.push(earlier);
                }
                None => {
                    return Ok(Some(PlannedWindow {
                        window,
                        batch,
                        irreducible: true,
                    }));
                }
            }
        }

        Ok(None)
    }
}
