use super::summary::{ExporterOutcome, ExporterStatus};
use super::{ExportEngine, ExportError};
use crate::config::types::{ExporterConfig, TruncationPolicy};
use crate::encode::build_artifact;
use crate::planner::{run_ceiling, PlannedWindow, WindowPlan};
use crate::source::TimeWindow;
use chrono::{DateTime, Utc};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where one exporter is within its run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportPhase {
    Idle,
    Planning,
    Fetching,
    Encoding,
    Committing,
    Advancing,
    Failed,
}

impl fmt::Display for ExportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub(super) struct ExporterRun<'a> {
    engine: &'a ExportEngine,
    exporter: &'a ExporterConfig,
    slug: String,
    phase: ExportPhase,
    outcome: ExporterOutcome,
}

impl<'a> ExporterRun<'a> {
    pub(super) fn new(engine: &'a ExportEngine, exporter: &'a ExporterConfig) -> Self {
        Self {
            engine,
            exporter,
            slug: exporter.slug(),
            phase: ExportPhase::Idle,
            outcome: ExporterOutcome::new(exporter.identity(), ExporterStatus::UpToDate),
        }
    }

    fn transition(&mut self, next: ExportPhase) {
        debug!(
            exporter = %self.exporter.identity(),
            from = %self.phase,
            to = %next,
            "Exporter phase change"
        );
        self.phase = next;
    }

    /// Counted once per exporter run, whichever way it ends
    fn record_bisections(&mut self, plan: &WindowPlan) {
        self.outcome.bisections = plan.bisections();
        self.engine.metrics.incr("bisections", plan.bisections());
    }

    fn fail(mut self, err: ExportError) -> ExporterOutcome {
        error!(
            exporter = %self.exporter.identity(),
            phase = %self.phase,
            watermark = ?self.outcome.watermark,
            error = %err,
            "Exporter failed, watermark left at last committed window"
        );
        self.transition(ExportPhase::Failed);
        self.outcome.status = ExporterStatus::Failed;
        self.outcome.error = Some(err);
        self.outcome
    }

    pub(super) async fn execute(
        mut self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> ExporterOutcome {
        let engine = self.engine;
        let exporter = self.exporter;
        let identity = exporter.identity();
        let settings = &engine.settings;

        self.transition(ExportPhase::Planning);
        let stored = match engine.watermarks.get(identity).await {
            Ok(Some(stored)) => Some(stored),
            // Older state files key watermarks by slug; the next advance rekeys by query
            Ok(None) => match engine.watermarks.get(&self.slug).await {
                Ok(legacy) => {
                    if let Some(legacy) = legacy {
                        info!(
                            exporter = %identity,
                            key = %self.slug,
                            watermark = %legacy,
                            "Resuming from legacy state entry"
                        );
                    }
                    legacy
                }
                Err(e) => return self.fail(e.into()),
            },
            Err(e) => return self.fail(e.into()),
        };
        self.outcome.watermark = stored;

        let resume = stored.unwrap_or(exporter.initial_start);
        let ceiling = run_ceiling(resume, now, settings.max_days_per_run, settings.holdoff_days);
        // Where an uncapped run would stop; anything between the two is backlog
        let target = run_ceiling(resume, now, 0, settings.holdoff_days);
        let mut plan = WindowPlan::new(identity, resume, ceiling, settings.limits);

        if plan.is_empty() {
            info!(exporter = %identity, watermark = %resume, "Nothing to export");
            self.transition(ExportPhase::Idle);
            return self.outcome;
        }

        info!(
            exporter = %identity,
            from = %resume,
            to = %ceiling,
            format = ?exporter.format,
            "Exporting"
        );

        loop {
            if cancel.is_cancelled() {
                info!(
                    exporter = %identity,
                    watermark = ?self.outcome.watermark,
                    "Cancelled, remaining windows left for the next run"
                );
                self.outcome.status = ExporterStatus::Partial;
                break;
            }

            self.transition(ExportPhase::Fetching);
            let planned = match plan.next(engine.source.as_ref()).await {
                Ok(Some(planned)) => planned,
                Ok(None) => {
                    self.outcome.status = if ceiling < target {
                        ExporterStatus::Behind
                    } else {
                        ExporterStatus::Complete
                    };
                    break;
                }
                Err(source) => {
                    // The failed window stays at the head of the plan
                    let window = plan.peek().unwrap_or(TimeWindow {
                        start: resume,
                        end: ceiling,
                    });
                    self.record_bisections(&plan);
                    return self.fail(ExportError::Source { window, source });
                }
            };

            if let Err(e) = self.process(planned).await {
                self.record_bisections(&plan);
                return self.fail(e);
            }
        }

        self.record_bisections(&plan);
        self.transition(ExportPhase::Idle);

        info!(
            exporter = %identity,
            status = %self.outcome.status,
            windows = self.outcome.windows_committed,
            records = self.outcome.records_exported,
            bisections = self.outcome.bisections,
            watermark = ?self.outcome.watermark,
            "Exporter finished"
        );
        self.outcome
    }

    /// Encode, commit and advance past one settled window
    async fn process(&mut self, planned: PlannedWindow) -> Result<(), ExportError> {
        let engine = self.engine;
        let exporter = self.exporter;
        let identity = exporter.identity();
        let PlannedWindow {
            window,
            batch,
            irreducible,
        } = planned;

        if irreducible {
            engine.metrics.incr("irreducible-windows", 1);
            match engine.settings.truncation_policy {
                TruncationPolicy::Warn => {
                    warn!(
                        exporter = %identity,
                        window = %window,
                        records = batch.len(),
                        "Window still truncated at minimum size, records may be missing"
                    );
                    self.outcome.irreducible_windows.push(window);
                }
                TruncationPolicy::Fail => {
                    return Err(ExportError::IrreducibleTruncation {
                        window,
                        limit: engine.settings.limits.max_records,
                    });
                }
            }
        }

        if batch.is_empty() && !engine.settings.write_empty_windows {
            debug!(exporter = %identity, window = %window, "Empty window, no artifact");
        } else {
            self.transition(ExportPhase::Encoding);
            let artifact = build_artifact(&self.slug, &window, &batch, exporter.format)
                .map_err(|source| ExportError::Encode { window, source })?;

            self.transition(ExportPhase::Committing);
            engine.commit(window, &artifact).await?;
            self.outcome.artifacts_written += 1;

            debug!(
                exporter = %identity,
                window_start = %window.start,
                window_end = %window.end,
                records = artifact.records,
                key = %artifact.key,
                "Committed window"
            );
        }

        self.transition(ExportPhase::Advancing);
        engine.watermarks.advance(identity, window.end).await?;

        self.outcome.watermark = Some(window.end);
        self.outcome.windows_committed += 1;
        self.outcome.records_exported += batch.len() as u64;
        engine.metrics.incr("windows-committed", 1);
        engine.metrics.incr("records-exported", batch.len() as u64);

        self.transition(ExportPhase::Idle);
        Ok(())
    }
}
