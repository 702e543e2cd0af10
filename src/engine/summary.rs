use super::ExportError;
use crate::source::TimeWindow;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterStatus {
    /// Every window up to `now` (less any holdoff) was committed
    Complete,
    /// Every planned window was committed but `max_days_per_run` stopped the
    /// run short; the backlog continues next run
    Behind,
    /// The watermark had already reached the run ceiling
    UpToDate,
    /// Cancelled with windows still pending
    Partial,
    Failed,
    /// `active: false`, state untouched
    Inactive,
}

impl fmt::Display for ExporterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExporterStatus::Complete => "complete",
            ExporterStatus::Behind => "behind",
            ExporterStatus::UpToDate => "up to date",
            ExporterStatus::Partial => "partial",
            ExporterStatus::Failed => "failed",
            ExporterStatus::Inactive => "inactive",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct ExporterOutcome {
    pub identity: String,
    pub status: ExporterStatus,
    pub windows_committed: u64,
    pub records_exported: u64,
    pub artifacts_written: u64,
    pub bisections: u64,
    /// Accepted windows that still returned a full page at the minimum size
    pub irreducible_windows: Vec<TimeWindow>,
    /// Watermark after the run, if the exporter has one
    pub watermark: Option<DateTime<Utc>>,
    pub error: Option<ExportError>,
}

impl ExporterOutcome {
    pub fn new(identity: impl Into<String>, status: ExporterStatus) -> Self {
        Self {
            identity: identity.into(),
            status,
            windows_committed: 0,
            records_exported: 0,
            artifacts_written: 0,
            bisections: 0,
            irreducible_windows: Vec::new(),
            watermark: None,
            error: None,
        }
    }

    pub fn is_caught_up(&self) -> bool {
        matches!(self.status, ExporterStatus::Complete | ExporterStatus::UpToDate)
    }
}

/// Result of one `ExportEngine::run`, in configuration order
#[derive(Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub outcomes: Vec<ExporterOutcome>,
}

impl RunSummary {
    fn count(&self, f: impl Fn(&ExporterOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| f(o)).count()
    }

    pub fn caught_up(&self) -> usize {
        self.count(|o| o.is_caught_up())
    }

    pub fn behind(&self) -> usize {
        self.count(|o| o.status == ExporterStatus::Behind)
    }

    pub fn partial(&self) -> usize {
        self.count(|o| o.status == ExporterStatus::Partial)
    }

    pub fn failed(&self) -> usize {
        self.count(|o| o.status == ExporterStatus::Failed)
    }

    pub fn inactive(&self) -> usize {
        self.count(|o| o.status == ExporterStatus::Inactive)
    }

    pub fn records_exported(&self) -> u64 {
        self.outcomes.iter().map(|o| o.records_exported).sum()
    }

    pub fn windows_committed(&self) -> u64 {
        self.outcomes.iter().map(|o| o.windows_committed).sum()
    }

    pub fn outcome(&self, identity: &str) -> Option<&ExporterOutcome> {
        self.outcomes.iter().find(|o| o.identity == identity)
    }

    /// No exporter failed or stopped early. Exporters held back by the day
    /// cap still count as success.
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.partial() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts() {
        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            elapsed: Duration::from_secs(1),
            outcomes: vec![
                ExporterOutcome::new("a", ExporterStatus::Complete),
                ExporterOutcome::new("b", ExporterStatus::UpToDate),
                ExporterOutcome::new("c", ExporterStatus::Failed),
                ExporterOutcome::new("d", ExporterStatus::Inactive),
                ExporterOutcome::new("e", ExporterStatus::Behind),
            ],
        };

        assert_eq!(summary.caught_up(), 2);
        assert_eq!(summary.behind(), 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.partial(), 0);
        assert_eq!(summary.inactive(), 1);
        assert!(!summary.is_success());
        assert_eq!(summary.outcome("b").unwrap().status, ExporterStatus::UpToDate);
    }

    #[test]
    fn test_behind_is_not_caught_up_but_succeeds() {
        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            elapsed: Duration::from_secs(1),
            outcomes: vec![ExporterOutcome::new("a", ExporterStatus::Behind)],
        };

        assert!(!summary.outcomes[0].is_caught_up());
        assert_eq!(summary.caught_up(), 0);
        assert!(summary.is_success());
    }
}
