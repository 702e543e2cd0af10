use super::types::*;
use crate::config::{expand_env_vars, expand_tilde, ENV_VAR_PATTERN};
use regex::Regex;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    use std::io::Read;

    let mut file = File::open(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut yaml_string = String::new();
    file.read_to_string(&mut yaml_string).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    let config = parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })?;

    Ok(config)
}

/// Parse and validate a config document held in memory
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    // Expand environment variables in the YAML string before parsing
    let yaml_string = expand_env_vars(yaml);

    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;

    expand_paths(&mut config);
    validate_config(&config)?;

    Ok(config)
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let re = Regex::new(ENV_VAR_PATTERN).expect("static regex");
    // Commented-out lines may mention variables that are deliberately unset
    let mut unexpanded_vars: Vec<String> = yaml_string
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .flat_map(|line| re.captures_iter(line))
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    let error_msg = if unexpanded_vars.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            unexpanded_vars[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables\n\
             2. Replace the variables in the config file with actual values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

fn expand_paths(config: &mut Config) {
    config.state.path = expand_tilde(&config.state.path);

    if let Some(local) = config.storage.local.as_mut() {
        local.path = expand_tilde(&local.path);
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if !is_http_url(&config.loki.endpoint) {
        errors.push(format!(
            "loki.endpoint '{}' must be an http:// or https:// URL",
            config.loki.endpoint
        ));
    }
    validate_retry("loki.retry", &config.loki.retry, &mut errors);

    if config.export.max_records_per_query == 0 {
        errors.push("export.max_records_per_query must be greater than 0".to_string());
    }
    if config.export.min_window.is_zero() {
        errors.push("export.min_window must be greater than 0".to_string());
    }
    if config.export.concurrency == 0 {
        errors.push("export.concurrency must be greater than 0".to_string());
    }
    if config.export.commit_attempts == 0 {
        errors.push("export.commit_attempts must be greater than 0".to_string());
    }

    if config.state.path.as_os_str().is_empty() {
        errors.push("state.path must not be empty".to_string());
    }

    if config.storage.local.is_none() && config.storage.object_store.is_none() {
        errors.push("storage: at least one of 'local' or 'object_store' must be configured".to_string());
    }
    if let Some(local) = &config.storage.local {
        if local.path.as_os_str().is_empty() {
            errors.push("storage.local.path must not be empty".to_string());
        }
    }
    if let Some(object_store) = &config.storage.object_store {
        if !is_http_url(&object_store.endpoint) {
            errors.push(format!(
                "storage.object_store.endpoint '{}' must be an http:// or https:// URL",
                object_store.endpoint
            ));
        }
        if object_store.bucket.trim().is_empty() {
            errors.push("storage.object_store.bucket must not be empty".to_string());
        }
        if object_store.region.trim().is_empty() {
            errors.push("storage.object_store.region must not be empty".to_string());
        }
        if object_store.access_key_id.is_some() != object_store.secret_access_key.is_some() {
            errors.push(
                "storage.object_store: access_key_id and secret_access_key must be set together"
                    .to_string(),
            );
        }
        validate_retry("storage.object_store.retry", &object_store.retry, &mut errors);
    }

    if let Some(metrics) = &config.metrics {
        if metrics.host.trim().is_empty() {
            errors.push("metrics.host must not be empty".to_string());
        }
    }

    let mut identities: HashMap<&str, usize> = HashMap::new();
    let mut slugs: HashMap<String, usize> = HashMap::new();
    for (index, exporter) in config.exporters.iter().enumerate() {
        if exporter.query.trim().is_empty() {
            errors.push(format!("exporters[{}]: query must not be empty", index));
            continue;
        }

        if let Some(first) = identities.insert(exporter.identity(), index) {
            errors.push(format!(
                "exporters[{}]: query '{}' duplicates exporters[{}]",
                index, exporter.query, first
            ));
            continue;
        }

        let slug = exporter.slug();
        if slug.trim_matches('_').is_empty() {
            errors.push(format!(
                "exporters[{}]: query '{}' does not yield a usable storage key prefix",
                index, exporter.query
            ));
        } else if let Some(first) = slugs.insert(slug.clone(), index) {
            errors.push(format!(
                "exporters[{}]: storage key prefix '{}' collides with exporters[{}]",
                index, slug, first
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_retry(section: &str, retry: &RetryConfig, errors: &mut Vec<String>) {
    if retry.max_attempts == 0 {
        errors.push(format!("{}.max_attempts must be greater than 0", section));
    }
    if retry.initial_backoff > retry.max_backoff {
        errors.push(format!(
            "{}.initial_backoff must not exceed {}.max_backoff",
            section, section
        ));
    }
}
