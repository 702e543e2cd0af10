use crate::config::parse::load_config;
use crate::config::types::{Config, StorageConfig};
use crate::engine::{EngineSettings, ExportEngine, ExporterStatus, RunSummary};
use crate::metrics::{GraphiteReporter, MetricsReporter, NoopReporter};
use crate::source::{LokiClient, SourceError};
use crate::storage::{
    FileWatermarkStore, LocalSink, ObjectStoreSink, StorageError, StorageSink, WatermarkError,
};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::parse::ConfigError),

    #[error("log source error: {0}")]
    Source(#[from] SourceError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("state error: {0}")]
    Watermark(#[from] WatermarkError),

    #[error("{failed} exporter(s) failed, {partial} stopped before catching up")]
    Incomplete { failed: usize, partial: usize },
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            super::print_searched_locations();
            eprintln!("\nUse --config <path> to specify a config file, or run 'loki-export config init' to generate one.");
            std::process::exit(1);
        }
    };

    run_export(&config_path).await?;
    Ok(())
}

/// Load the config, run every exporter once, and fail unless all caught up
pub async fn run_export(config_path: &Path) -> Result<RunSummary, RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;
    let engine = build_engine(&config).await?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    let signal_task = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, finishing the current windows");
            signal_cancel.cancel();
        }
    });

    let summary = engine.run(&config.exporters, Utc::now(), cancel).await;
    signal_task.abort();

    print_summary(&summary);

    if summary.is_success() {
        Ok(summary)
    } else {
        Err(RunError::Incomplete {
            failed: summary.failed(),
            partial: summary.partial(),
        })
    }
}

pub async fn build_engine(config: &Config) -> Result<ExportEngine, RunError> {
    info!(endpoint = %config.loki.endpoint, "Creating Loki client");
    let source = Arc::new(LokiClient::new(&config.loki)?);

    let sinks = build_sinks(&config.storage)?;

    info!(path = %config.state.path.display(), "Opening watermark state");
    let watermarks = Arc::new(FileWatermarkStore::open(&config.state.path).await?);

    let metrics: Arc<dyn MetricsReporter> = match &config.metrics {
        Some(metrics) => {
            info!(host = %metrics.host, port = metrics.port, "Reporting metrics to Graphite");
            Arc::new(GraphiteReporter::new(metrics))
        }
        None => Arc::new(NoopReporter),
    };

    Ok(ExportEngine::new(
        source,
        sinks,
        watermarks,
        EngineSettings::from(&config.export),
    )
    .with_metrics(metrics))
}

pub fn build_sinks(config: &StorageConfig) -> Result<Vec<Arc<dyn StorageSink>>, StorageError> {
    let mut sinks: Vec<Arc<dyn StorageSink>> = Vec::new();

    if let Some(local) = &config.local {
        info!(path = %local.path.display(), "Writing artifacts to local directory");
        sinks.push(Arc::new(LocalSink::new(&local.path)));
    }

    if let Some(object_store) = &config.object_store {
        info!(
            endpoint = %object_store.endpoint,
            bucket = %object_store.bucket,
            "Writing artifacts to object store"
        );
        sinks.push(Arc::new(ObjectStoreSink::new(object_store)?));
    }

    Ok(sinks)
}

fn print_summary(summary: &RunSummary) {
    println!("Run {} finished in {:.1}s", summary.run_id, summary.elapsed.as_secs_f64());

    for outcome in &summary.outcomes {
        let watermark = outcome
            .watermark
            .map(|w| w.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<12} {}  windows={} records={} watermark={}",
            outcome.status.to_string(),
            outcome.identity,
            outcome.windows_committed,
            outcome.records_exported,
            watermark
        );

        if !outcome.irreducible_windows.is_empty() {
            println!(
                "               {} window(s) truncated at minimum size, records may be missing",
                outcome.irreducible_windows.len()
            );
        }
        if outcome.status == ExporterStatus::Failed {
            if let Some(err) = &outcome.error {
                println!("               error: {}", err);
            }
        }
    }

    println!(
        "caught up: {}, behind: {}, partial: {}, failed: {}, inactive: {}",
        summary.caught_up(),
        summary.behind(),
        summary.partial(),
        summary.failed(),
        summary.inactive()
    );
}
