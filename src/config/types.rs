use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub loki: LokiConfig,
    #[serde(default)]
    pub export: ExportConfig,
    pub state: StateConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub exporters: Vec<ExporterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LokiConfig {
    pub endpoint: String,
    /// Sent as `X-Scope-OrgID` for multi-tenant Loki deployments
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportConfig {
    /// Hard cap the log store applies to a single query
    pub max_records_per_query: usize,
    /// Backlog drained per run, in days. 0 means unbounded.
    pub max_days_per_run: u32,
    /// Only export complete days, ending this many days before today
    pub holdoff_days: Option<u32>,
    #[serde(with = "humantime_serde")]
    pub min_window: Duration,
    pub truncation_policy: TruncationPolicy,
    pub concurrency: usize,
    pub commit_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub run_timeout: Option<Duration>,
    pub write_empty_windows: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            max_records_per_query: 5000,
            max_days_per_run: 0,
            holdoff_days: None,
            min_window: Duration::from_secs(1),
            truncation_policy: TruncationPolicy::Warn,
            concurrency: 1,
            commit_attempts: 3,
            run_timeout: None,
            write_empty_windows: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruncationPolicy {
    /// Accept the window and report it
    Warn,
    /// Stop the exporter at the window
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default)]
    pub local: Option<LocalStorageConfig>,
    #[serde(default)]
    pub object_store: Option<ObjectStoreConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalStorageConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectStoreConfig {
    /// S3-compatible endpoint, e.g. `https://s3.eu-west-1.amazonaws.com`
    pub endpoint: String,
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Static credentials; both or neither. Without them requests go unsigned.
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    pub host: String,
    #[serde(default = "default_graphite_port")]
    pub port: u16,
    #[serde(default)]
    pub prefix: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_graphite_port() -> u16 {
    2003
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExporterConfig {
    #[serde(default = "default_active")]
    pub active: bool,
    pub query: String,
    #[serde(alias = "time_start", with = "start_format")]
    pub initial_start: DateTime<Utc>,
    #[serde(default)]
    pub format: ExportFormat,
}

fn default_active() -> bool {
    true
}

impl ExporterConfig {
    /// Identity used as the watermark key
    pub fn identity(&self) -> &str {
        &self.query
    }

    /// Filesystem-safe form of the query, used as the storage key prefix
    pub fn slug(&self) -> String {
        query_slug(&self.query)
    }
}

/// Drops braces and quotes, and replaces everything outside `[a-z]` with `_`.
///
/// `{job="varlogs"}` becomes `job_varlogs`.
pub fn query_slug(query: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r#"([{}"])|[^a-z]"#).expect("static regex"));

    re.replace_all(query, |caps: &regex::Captures| {
        if caps.get(1).is_some() {
            String::new()
        } else {
            "_".to_string()
        }
    })
    .to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// W3C extended log format, one record per line
    Elf,
    #[default]
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Elf => "log",
            ExportFormat::Json => "json",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Elf => "text/plain; charset=utf-8",
            ExportFormat::Json => "application/json",
        }
    }
}

// Accepts RFC 3339 or the plain `YYYY-MM-DD HH:MM:SS` form (read as UTC)
pub(crate) mod start_format {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_start(&s).map_err(serde::de::Error::custom)
    }

    pub fn parse_start(s: &str) -> Result<DateTime<Utc>, String> {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(dt.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
            return Ok(naive.and_utc());
        }
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Ok(date.and_hms_opt(0, 0, 0).expect("midnight is valid").and_utc());
        }
        Err(format!(
            "invalid start time '{}': expected RFC 3339 or 'YYYY-MM-DD HH:MM:SS'",
            s
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_query_slug() {
        assert_eq!(query_slug(r#"{job="varlogs"}"#), "job_varlogs");
        assert_eq!(
            query_slug(r#"{app="nginx",env="prod"}"#),
            "app_nginx_env_prod"
        );
        assert_eq!(query_slug(r#"{App="x1"}"#), "_pp_x_");
    }

    #[test]
    fn test_parse_start_formats() {
        let expected = Utc.with_ymd_and_hms(2020, 2, 23, 0, 0, 0).unwrap();
        assert_eq!(start_format::parse_start("2020-02-23 00:00:00").unwrap(), expected);
        assert_eq!(start_format::parse_start("2020-02-23T00:00:00Z").unwrap(), expected);
        assert_eq!(
            start_format::parse_start("2020-02-23T01:00:00+01:00").unwrap(),
            expected
        );
        assert_eq!(start_format::parse_start("2020-02-23").unwrap(), expected);
        assert!(start_format::parse_start("yesterday").is_err());
    }

    #[test]
    fn test_format_defaults_to_json() {
        let exporter: ExporterConfig =
            serde_yaml::from_str("query: '{job=\"a\"}'\ninitial_start: 2020-02-23 00:00:00\n")
                .unwrap();
        assert!(exporter.active);
        assert_eq!(exporter.format, ExportFormat::Json);
    }

    #[test]
    fn test_time_start_alias() {
        let exporter: ExporterConfig = serde_yaml::from_str(
            "query: '{job=\"a\"}'\ntime_start: 2020-02-23 00:00:00\nformat: elf\n",
        )
        .unwrap();
        assert_eq!(exporter.format, ExportFormat::Elf);
        assert_eq!(
            exporter.initial_start,
            Utc.with_ymd_and_hms(2020, 2, 23, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_unknown_format_rejected() {
        let result: Result<ExporterConfig, _> = serde_yaml::from_str(
            "query: '{job=\"a\"}'\ninitial_start: 2020-02-23 00:00:00\nformat: csv\n",
        );
        assert!(result.is_err());
    }
}
