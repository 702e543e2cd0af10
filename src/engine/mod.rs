//! One export run across all configured exporters.
//!
//! Per exporter: read the watermark, plan windows, and for each window fetch,
//! encode, commit to every sink, then advance the watermark. A window is only
//! advanced past once all sinks hold its artifact.

mod exporter;
mod summary;

pub use exporter::ExportPhase;
pub use summary::{ExporterOutcome, ExporterStatus, RunSummary};

use crate::config::types::{ExportConfig, ExporterConfig, TruncationPolicy};
use crate::encode::{EncodeError, EncodedArtifact};
use crate::metrics::{MetricsReporter, NoopReporter};
use crate::planner::PlanLimits;
use crate::retry::{RetryError, RetryPolicy, Retryable};
use crate::source::{LogSource, SourceError, TimeWindow};
use crate::storage::{StorageError, StorageSink, WatermarkError, WatermarkStore};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("fetching window {window}: {source}")]
    Source {
        window: TimeWindow,
        #[source]
        source: SourceError,
    },

    #[error("encoding window {window}: {source}")]
    Encode {
        window: TimeWindow,
        #[source]
        source: EncodeError,
    },

    #[error("committing window {window} failed after {attempts} attempts: {source}")]
    Storage {
        window: TimeWindow,
        attempts: u32,
        #[source]
        source: StorageError,
    },

    #[error("watermark state: {0}")]
    Watermark(#[from] WatermarkError),

    #[error("window {window} still returned a full page of {limit} records at minimum granularity")]
    IrreducibleTruncation { window: TimeWindow, limit: usize },
}

/// Knobs of a run, taken from the `export` config section
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub limits: PlanLimits,
    pub max_days_per_run: u32,
    pub holdoff_days: Option<u32>,
    pub truncation_policy: TruncationPolicy,
    pub concurrency: usize,
    pub commit_retry: RetryPolicy,
    pub run_timeout: Option<Duration>,
    pub write_empty_windows: bool,
}

impl From<&ExportConfig> for EngineSettings {
    fn from(config: &ExportConfig) -> Self {
        let min_window = chrono::Duration::from_std(config.min_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(1));

        Self {
            limits: PlanLimits {
                max_records: config.max_records_per_query,
                min_window,
            },
            max_days_per_run: config.max_days_per_run,
            holdoff_days: config.holdoff_days,
            truncation_policy: config.truncation_policy,
            concurrency: config.concurrency.max(1),
            commit_retry: RetryPolicy::new(
                config.commit_attempts,
                Duration::from_millis(500),
                Duration::from_secs(10),
            ),
            run_timeout: config.run_timeout,
            write_empty_windows: config.write_empty_windows,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&ExportConfig::default())
    }
}

/// Failures of one commit attempt, one entry per sink that failed
#[derive(Debug)]
struct CommitFailure(Vec<StorageError>);

impl fmt::Display for CommitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        f.write_str(&messages.join("; "))
    }
}

impl Retryable for CommitFailure {
    fn is_retryable(&self) -> bool {
        !self
            .0
            .iter()
            .any(|e| matches!(e, StorageError::InvalidKey(_)))
    }
}

pub struct ExportEngine {
    source: Arc<dyn LogSource>,
    sinks: Vec<Arc<dyn StorageSink>>,
    watermarks: Arc<dyn WatermarkStore>,
    metrics: Arc<dyn MetricsReporter>,
    settings: EngineSettings,
}

impl ExportEngine {
    pub fn new(
        source: Arc<dyn LogSource>,
        sinks: Vec<Arc<dyn StorageSink>>,
        watermarks: Arc<dyn WatermarkStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            source,
            sinks,
            watermarks,
            metrics: Arc::new(NoopReporter),
            settings,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsReporter>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Run every exporter once against `now`.
    ///
    /// Cancelling `cancel` stops new windows from starting; a window that is
    /// already committing finishes first.
    pub async fn run(
        &self,
        exporters: &[ExporterConfig],
        now: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();

        // Own token so the timeout never cancels the caller's
        let cancel = cancel.child_token();
        let timer = self.settings.run_timeout.map(|timeout| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        warn!(timeout = ?timeout, "Run timeout reached, not starting new windows");
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            })
        });

        info!(
            run_id = %run_id,
            exporters = exporters.len(),
            sinks = self.sinks.len(),
            "Starting export run"
        );

        let mut indexed: Vec<(usize, ExporterOutcome)> = stream::iter(exporters.iter().enumerate())
            .map(|(index, exporter)| {
                let cancel = cancel.clone();
                async move {
                    let outcome = if exporter.active {
                        exporter::ExporterRun::new(self, exporter)
                            .execute(now, &cancel)
                            .await
                    } else {
                        info!(exporter = %exporter.identity(), "Exporter inactive, skipping");
                        ExporterOutcome::new(exporter.identity(), ExporterStatus::Inactive)
                    };
                    (index, outcome)
                }
            })
            .buffer_unordered(self.settings.concurrency)
            .collect()
            .await;

        if let Some(timer) = timer {
            timer.abort();
        }

        indexed.sort_by_key(|(index, _)| *index);
        let summary = RunSummary {
            run_id,
            started_at,
            elapsed: clock.elapsed(),
            outcomes: indexed.into_iter().map(|(_, outcome)| outcome).collect(),
        };

        self.report_run(&summary).await;
        summary
    }

    async fn report_run(&self, summary: &RunSummary) {
        self.metrics.incr("exporters.caught-up", summary.caught_up() as u64);
        self.metrics.incr("exporters.behind", summary.behind() as u64);
        self.metrics.incr("exporters.partial", summary.partial() as u64);
        self.metrics.incr("exporters.failed", summary.failed() as u64);
        self.metrics
            .gauge("time-elapsed", summary.elapsed.as_secs_f64());
        self.metrics.flush().await;

        info!(
            run_id = %summary.run_id,
            caught_up = summary.caught_up(),
            behind = summary.behind(),
            partial = summary.partial(),
            failed = summary.failed(),
            inactive = summary.inactive(),
            windows = summary.windows_committed(),
            records = summary.records_exported(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Export run finished"
        );
    }

    /// Put the artifact on every sink at once; retry the whole set until all succeed.
    async fn commit(&self, window: TimeWindow, artifact: &EncodedArtifact) -> Result<(), ExportError> {
        let sinks = &self.sinks;
        let attempt = move || async move {
            let results = futures::future::join_all(sinks.iter().map(|sink| sink.put(artifact))).await;

            let failures: Vec<StorageError> = results.into_iter().filter_map(Result::err).collect();
            if failures.is_empty() {
                Ok(())
            } else {
                Err(CommitFailure(failures))
            }
        };

        match self.settings.commit_retry.run("commit", attempt).await {
            Ok(()) => {
                for sink in &self.sinks {
                    self.metrics.incr(&format!("files-written.{}", sink.name()), 1);
                    self.metrics.incr(
                        &format!("lines-written.{}", sink.name()),
                        artifact.records as u64,
                    );
                }
                Ok(())
            }
            Err(RetryError::Exhausted { attempts, last }) => Err(Self::commit_error(window, attempts, last)),
            Err(RetryError::Permanent(last)) => Err(Self::commit_error(window, 1, last)),
        }
    }

    fn commit_error(window: TimeWindow, attempts: u32, failure: CommitFailure) -> ExportError {
        let source = failure
            .0
            .into_iter()
            .next()
            .unwrap_or_else(|| StorageError::Unavailable {
                sink: "unknown".to_string(),
                message: "commit failed".to_string(),
            });
        ExportError::Storage {
            window,
            attempts,
            source,
        }
    }
}
