use clap::{Parser, Subcommand};
use loki_export::config::resolve_config_path;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "loki-export")]
#[command(about = "Incremental Loki log exporter", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Export every active exporter up to now (default)
    Run,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    State {
        #[command(subcommand)]
        action: StateAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a starter config
    Init {
        #[arg(long)]
        stdout: bool,
    },
    /// Validate the config and list its exporters
    Check,
}

#[derive(Subcommand)]
enum StateAction {
    /// Print the stored watermark of each exporter
    Show,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loki_export=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::Run) | None => {
            loki_export::cli::run::run(config_path).await?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => {
                loki_export::cli::config::init(stdout)?;
            }
            ConfigAction::Check => {
                loki_export::cli::config::check(config_path)?;
            }
        },
        Some(Commands::State { action }) => match action {
            StateAction::Show => {
                loki_export::cli::state::show(config_path).await?;
            }
        },
    }

    Ok(())
}
