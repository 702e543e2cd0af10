use crate::config::generate::generate_starter_config;
use std::fs;
use std::path::PathBuf;

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    write_config(&generate_starter_config(), stdout)
}

fn write_config(config_content: &str, stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    // Prefer ~/.config/loki-export, fall back to /etc/loki-export
    let config_path = dirs::home_dir()
        .map(|home| home.join(".config/loki-export/config.yml"))
        .filter(|path| match path.parent() {
            Some(parent) => match fs::create_dir_all(parent) {
                Ok(()) => true,
                Err(_) => {
                    eprintln!("Warning: Could not create directory {}", parent.display());
                    eprintln!("Falling back to /etc/loki-export/config.yml");
                    false
                }
            },
            None => false,
        })
        .unwrap_or_else(|| PathBuf::from("/etc/loki-export/config.yml"));

    if config_path.exists() {
        eprintln!(
            "Error: Config file already exists at {}",
            config_path.display()
        );
        eprintln!("Remove it first or use --stdout to print the config");
        std::process::exit(1);
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&config_path, config_content)?;

    println!("Config file written to {}", config_path.display());
    Ok(())
}

pub fn check(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            super::print_searched_locations();
            std::process::exit(1);
        }
    };

    println!("Validating config file: {}", path.display());

    match crate::config::load_config(&path) {
        Ok(config) => {
            println!("✓ Config is valid");
            for exporter in &config.exporters {
                println!(
                    "  {} {} -> {} ({:?}, from {})",
                    if exporter.active { "+" } else { "-" },
                    exporter.query,
                    exporter.slug(),
                    exporter.format,
                    exporter.initial_start.to_rfc3339()
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Config validation failed:\n{}", e);
            std::process::exit(1);
        }
    }
}
