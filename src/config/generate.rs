pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# LOKI-EXPORT CONFIGURATION
# =============================================================================
# Exports log records from Loki into compressed archives, one exporter per
# label-selector query. Progress is tracked in the state file so repeated runs
# never re-export or skip a time range.
#
# Values of the form $env{VAR_NAME} are replaced with environment variables
# before parsing.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/loki-export/config.yml
#   3. /etc/loki-export/config.yml

# =============================================================================
# LOKI
# =============================================================================
loki:
  endpoint: http://localhost:3100
  # tenant_id: my-tenant          # sent as X-Scope-OrgID
  # token: $env{LOKI_TOKEN}       # bearer token
  timeout: 30s
  retry:
    max_attempts: 5
    initial_backoff: 500ms
    max_backoff: 30s

# =============================================================================
# EXPORT
# =============================================================================
export:
  # Must match the query limit enforced by Loki (limits_config.max_entries_limit_per_query)
  max_records_per_query: 5000
  # Days of backlog drained per run; 0 drains everything up to now
  max_days_per_run: 1
  # Only export complete days, ending this many days before today
  # holdoff_days: 0
  # Smallest window the planner bisects down to
  min_window: 1s
  # What to do when a window of min_window still hits the limit: warn or fail
  truncation_policy: warn
  # Exporters processed in parallel
  concurrency: 1
  # Attempts to write one window to every storage backend
  commit_attempts: 3
  # run_timeout: 1h
  write_empty_windows: false

# =============================================================================
# STATE
# =============================================================================
state:
  path: ~/.local/share/loki-export/state.json

# =============================================================================
# STORAGE
# =============================================================================
# Every configured backend must accept a window before progress is recorded.
storage:
  local:
    path: ~/loki-export
  # object_store:                 # S3 or S3-compatible (MinIO, R2, ...)
  #   endpoint: https://s3.eu-west-1.amazonaws.com
  #   bucket: log-archive
  #   region: eu-west-1
  #   access_key_id: $env{AWS_ACCESS_KEY_ID}
  #   secret_access_key: $env{AWS_SECRET_ACCESS_KEY}
  #   timeout: 60s

# =============================================================================
# METRICS (optional)
# =============================================================================
# metrics:
#   host: graphite.example.com
#   port: 2003
#   prefix: loki_export

# =============================================================================
# EXPORTERS
# =============================================================================
exporters:
  - active: true
    query: '{job="varlogs"}'
    initial_start: 2020-02-23 00:00:00
    format: elf

  - active: false
    query: '{app="nginx"}'
    initial_start: 2020-02-23T00:00:00Z
    format: json
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn test_starter_config_is_valid() {
        let config = parse_config(&generate_starter_config()).expect("starter config should parse");
        assert_eq!(config.exporters.len(), 2);
        assert_eq!(config.export.max_days_per_run, 1);
        assert!(config.storage.local.is_some());
        assert!(config.storage.object_store.is_none());
    }
}
