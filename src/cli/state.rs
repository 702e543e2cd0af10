use crate::config::parse::load_config;
use crate::storage::FileWatermarkStore;
use chrono::SecondsFormat;
use std::path::PathBuf;

/// Print each exporter's watermark, plus state entries no exporter claims
pub async fn show(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            super::print_searched_locations();
            std::process::exit(1);
        }
    };

    let config = load_config(&path)?;
    let store = FileWatermarkStore::open(&config.state.path).await?;
    let mut entries = store.snapshot().await;

    println!("State file: {}", store.path().display());

    for exporter in &config.exporters {
        let legacy = entries.remove(&exporter.slug());
        let watermark = entries
            .remove(exporter.identity())
            .or(legacy)
            .map(|w| w.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            .unwrap_or_else(|| {
                format!(
                    "(none, starts at {})",
                    exporter.initial_start.to_rfc3339_opts(SecondsFormat::AutoSi, true)
                )
            });
        let marker = if exporter.active { "" } else { " [inactive]" };
        println!("  {}{}: {}", exporter.identity(), marker, watermark);
    }

    if !entries.is_empty() {
        println!("Entries without a configured exporter:");
        for (identity, watermark) in entries {
            println!(
                "  {}: {}",
                identity,
                watermark.to_rfc3339_opts(SecondsFormat::AutoSi, true)
            );
        }
    }

    Ok(())
}
