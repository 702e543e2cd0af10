use super::{from_nanos, to_nanos, LogRecord, LogSource, RecordBatch, SourceError, TimeWindow};
use crate::config::types::LokiConfig;
use crate::retry::{RetryError, RetryPolicy, Retryable};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

const QUERY_RANGE_PATH: &str = "/loki/api/v1/query_range";

/// Outcome of a single HTTP round trip, before retry handling
#[derive(Debug, Error)]
enum AttemptError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned status {status}: {message}")]
    Server { status: u16, message: String },

    #[error("query rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("{0}")]
    Decode(String),
}

impl Retryable for AttemptError {
    fn is_retryable(&self) -> bool {
        matches!(self, AttemptError::Transport(_) | AttemptError::Server { .. })
    }
}

impl From<RetryError<AttemptError>> for SourceError {
    fn from(err: RetryError<AttemptError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } => SourceError::Unavailable {
                attempts,
                message: last.to_string(),
            },
            RetryError::Permanent(AttemptError::Rejected { status, message }) => {
                SourceError::Rejected { status, message }
            }
            RetryError::Permanent(AttemptError::Decode(message)) => SourceError::Decode(message),
            RetryError::Permanent(other) => SourceError::Unavailable {
                attempts: 1,
                message: other.to_string(),
            },
        }
    }
}

/// HTTP client for Loki's `query_range` API
#[derive(Debug)]
pub struct LokiClient {
    base_url: String,
    tenant_id: Option<String>,
    token: Option<String>,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl LokiClient {
    pub fn new(config: &LokiConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            tenant_id: config.tenant_id.clone(),
            token: config.token.clone(),
            client,
            retry: RetryPolicy::from(&config.retry),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn query_range_once(
        &self,
        query: &str,
        window: TimeWindow,
        start: i64,
        end: i64,
        limit: usize,
    ) -> Result<RecordBatch, AttemptError> {
        let url = format!("{}{}", self.base_url, QUERY_RANGE_PATH);
        let params = [
            ("query", query.to_string()),
            ("start", start.to_string()),
            ("end", end.to_string()),
            ("limit", limit.to_string()),
            ("direction", "forward".to_string()),
        ];

        let mut request = self.client.get(&url).query(&params);
        if let Some(tenant_id) = &self.tenant_id {
            request = request.header("X-Scope-OrgID", tenant_id);
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AttemptError::Server {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        if !status.is_success() {
            return Err(AttemptError::Rejected {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let body = response.bytes().await?;
        let parsed: QueryRangeResponse = serde_json::from_slice(&body)
            .map_err(|e| AttemptError::Decode(format!("invalid query_range body: {}", e)))?;

        parsed.into_batch(window)
    }
}

#[async_trait]
impl LogSource for LokiClient {
    async fn fetch(
        &self,
        query: &str,
        window: TimeWindow,
        limit: usize,
    ) -> Result<RecordBatch, SourceError> {
        let (start, end) = match (to_nanos(window.start), to_nanos(window.end)) {
            (Some(start), Some(end)) => (start, end),
            _ => return Err(SourceError::WindowOutOfRange(window)),
        };

        let started = Instant::now();
        let batch = self
            .retry
            .run("loki", move || self.query_range_once(query, window, start, end, limit))
            .await?;

        debug!(
            query = %query,
            window = %window,
            records = batch.len(),
            returned = batch.returned,
            latency_ms = started.elapsed().as_millis() as u64,
            "Fetched window from Loki"
        );

        Ok(batch)
    }
}

// ===== Response Types =====

#[derive(Debug, Deserialize)]
struct QueryRangeResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryRangeData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryRangeData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Vec<StreamResult>,
}

#[derive(Debug, Deserialize)]
struct StreamResult {
    #[serde(default)]
    stream: BTreeMap<String, String>,
    /// `[timestamp_ns, line]`, optionally followed by structured metadata
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

impl QueryRangeResponse {
    fn into_batch(self, window: TimeWindow) -> Result<RecordBatch, AttemptError> {
        if self.status != "success" {
            return Err(AttemptError::Rejected {
                status: 200,
                message: self.error.unwrap_or(self.status),
            });
        }

        let Some(data) = self.data else {
            return Ok(RecordBatch::default());
        };

        if data.result_type != "streams" {
            return Err(AttemptError::Decode(format!(
                "expected resultType 'streams', got '{}'; metric queries cannot be exported",
                data.result_type
            )));
        }

        let mut returned = 0;
        let mut records = Vec::new();
        for stream in data.result {
            for value in stream.values {
                returned += 1;
                let record = parse_value(&stream.stream, value)?;
                if window.contains(record.timestamp) {
                    records.push(record);
                }
            }
        }

        if records.len() < returned {
            debug!(
                window = %window,
                dropped = returned - records.len(),
                "Dropped records outside the requested window"
            );
        }

        Ok(RecordBatch::with_returned(records, returned))
    }
}

fn parse_value(
    stream_labels: &BTreeMap<String, String>,
    value: Vec<serde_json::Value>,
) -> Result<LogRecord, AttemptError> {
    let mut parts = value.into_iter();

    let timestamp = parts
        .next()
        .and_then(|v| v.as_str().and_then(|s| s.parse::<i64>().ok()))
        .and_then(from_nanos)
        .ok_or_else(|| AttemptError::Decode("entry has no valid nanosecond timestamp".to_string()))?;

    let line = match parts.next() {
        Some(serde_json::Value::String(line)) => line,
        _ => return Err(AttemptError::Decode("entry has no log line".to_string())),
    };

    let mut labels = stream_labels.clone();
    // Structured metadata never overrides stream labels
    if let Some(serde_json::Value::Object(metadata)) = parts.next() {
        for (key, value) in metadata {
            if let serde_json::Value::String(value) = value {
                labels.entry(key).or_insert(value);
            }
        }
    }

    Ok(LogRecord {
        timestamp,
        labels,
        line,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::RetryConfig;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn window() -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2020, 2, 23, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2020, 2, 24, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let config = LokiConfig {
            endpoint: "http://localhost:3100/".to_string(),
            tenant_id: None,
            token: None,
            timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
        };

        let client = LokiClient::new(&config).unwrap();
        assert_eq!(client.base_url(), "http://localhost:3100");
    }

    #[test]
    fn test_parses_streams_and_filters_window() {
        let body = r#"{
            "status": "success",
            "data": {
                "resultType": "streams",
                "result": [
                    {"stream": {"job": "b"}, "values": [["1582416002000000000", "second"]]},
                    {"stream": {"job": "a"}, "values": [
                        ["1582416001000000000", "first", {"trace_id": "abc", "job": "ignored"}],
                        ["1582502400000000000", "at end, excluded"]
                    ]}
                ]
            }
        }"#;

        let parsed: QueryRangeResponse = serde_json::from_str(body).unwrap();
        let batch = parsed.into_batch(window()).unwrap();

        assert_eq!(batch.returned, 3);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[0].line, "first");
        assert_eq!(batch.records[0].labels.get("job").unwrap(), "a");
        assert_eq!(batch.records[0].labels.get("trace_id").unwrap(), "abc");
        assert_eq!(batch.records[1].line, "second");
    }

    #[test]
    fn test_error_status_is_rejected() {
        let body = r#"{"status": "error", "error": "parse error at line 1"}"#;
        let parsed: QueryRangeResponse = serde_json::from_str(body).unwrap();
        let err = parsed.into_batch(window()).unwrap_err();
        assert!(matches!(err, AttemptError::Rejected { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_matrix_result_is_decode_error() {
        let body = r#"{"status": "success", "data": {"resultType": "matrix", "result": []}}"#;
        let parsed: QueryRangeResponse = serde_json::from_str(body).unwrap();
        assert!(matches!(
            parsed.into_batch(window()),
            Err(AttemptError::Decode(_))
        ));
    }
}
