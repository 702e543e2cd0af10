use super::EncodeError;
use crate::source::{from_nanos, to_nanos, LogRecord, RecordBatch};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize)]
struct Document<'a> {
    records: Vec<Entry<'a>>,
}

/// Timestamps are nanosecond epoch strings, matching the log store's own API
#[derive(Serialize)]
struct Entry<'a> {
    ts: String,
    labels: &'a BTreeMap<String, String>,
    line: &'a str,
}

#[derive(Deserialize)]
struct OwnedDocument {
    records: Vec<OwnedEntry>,
}

#[derive(Deserialize)]
struct OwnedEntry {
    ts: String,
    labels: BTreeMap<String, String>,
    line: String,
}

pub fn encode(batch: &RecordBatch) -> Result<Vec<u8>, EncodeError> {
    let records = batch
        .records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let nanos = to_nanos(record.timestamp).ok_or_else(|| EncodeError::MalformedRecord {
                index,
                reason: format!(
                    "timestamp {} is outside the nanosecond epoch range",
                    record.timestamp
                ),
            })?;
            Ok(Entry {
                ts: nanos.to_string(),
                labels: &record.labels,
                line: &record.line,
            })
        })
        .collect::<Result<Vec<_>, EncodeError>>()?;

    let mut out = serde_json::to_vec_pretty(&Document { records }).map_err(|e| {
        EncodeError::MalformedRecord {
            index: 0,
            reason: e.to_string(),
        }
    })?;
    out.push(b'\n');
    Ok(out)
}

pub fn decode(data: &[u8]) -> Result<Vec<LogRecord>, String> {
    let document: OwnedDocument = serde_json::from_slice(data).map_err(|e| e.to_string())?;

    document
        .records
        .into_iter()
        .map(|entry| {
            let timestamp = entry
                .ts
                .parse::<i64>()
                .ok()
                .and_then(from_nanos)
                .ok_or_else(|| format!("invalid timestamp '{}'", entry.ts))?;
            Ok(LogRecord {
                timestamp,
                labels: entry.labels,
                line: entry.line,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_preserves_labels_and_raw_line() {
        let ts = Utc.with_ymd_and_hms(2020, 2, 23, 0, 0, 1).unwrap();
        let mut labels = BTreeMap::new();
        labels.insert("job".to_string(), "varlogs".to_string());
        labels.insert("filename".to_string(), "/var/log/syslog".to_string());

        let original = vec![
            LogRecord {
                timestamp: ts,
                labels: labels.clone(),
                line: "it's \"quoted\" and\ttabbed \u{e9}".to_string(),
            },
            LogRecord {
                timestamp: ts + chrono::Duration::nanoseconds(1),
                labels,
                line: String::new(),
            },
        ];

        let encoded = encode(&RecordBatch::new(original.clone())).unwrap();
        let text = String::from_utf8(encoded.clone()).unwrap();
        assert!(text.contains("\"ts\": \"1582416001000000000\""));

        assert_eq!(decode(&encoded).unwrap(), original);
    }

    #[test]
    fn test_empty_batch() {
        let encoded = encode(&RecordBatch::default()).unwrap();
        assert!(decode(&encoded).unwrap().is_empty());
    }
}
