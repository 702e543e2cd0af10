//! W3C extended log format.
//!
//! ```text
//! #Version: 1.0
//! #Fields: date time labels message
//! 2020-02-23	12:00:00.000000000	{job="varlogs"}	GET /index.html 200
//! ```
//!
//! Tabs separate fields, so tabs and line breaks inside a message are escaped
//! with a backslash to keep each record on one line.

use super::EncodeError;
use crate::source::{LogRecord, RecordBatch};
use chrono::NaiveDateTime;
use std::collections::BTreeMap;

const HEADER: &str = "#Version: 1.0\n#Fields: date time labels message\n";

pub fn encode(batch: &RecordBatch) -> Result<Vec<u8>, EncodeError> {
    let mut out = String::with_capacity(HEADER.len() + batch.len() * 128);
    out.push_str(HEADER);

    for (index, record) in batch.records.iter().enumerate() {
        write_record(&mut out, index, record)?;
    }

    Ok(out.into_bytes())
}

fn write_record(out: &mut String, index: usize, record: &LogRecord) -> Result<(), EncodeError> {
    out.push_str(&record.timestamp.format("%Y-%m-%d\t%H:%M:%S%.9f").to_string());
    out.push('\t');

    out.push('{');
    for (i, (key, value)) in record.labels.iter().enumerate() {
        if !is_valid_label_name(key) {
            return Err(EncodeError::MalformedRecord {
                index,
                reason: format!("label name '{}' is not a valid identifier", key),
            });
        }
        if i > 0 {
            out.push(',');
        }
        out.push_str(key);
        out.push_str("=\"");
        escape_into(out, value, true);
        out.push('"');
    }
    out.push_str("}\t");

    escape_into(out, &record.line, false);
    out.push('\n');
    Ok(())
}

fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn escape_into(out: &mut String, text: &str, quoted: bool) {
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '"' if quoted => out.push_str("\\\""),
            other => out.push(other),
        }
    }
}

/// Parse an encoded document back into records.
pub fn decode(data: &[u8]) -> Result<Vec<LogRecord>, String> {
    let text = std::str::from_utf8(data).map_err(|e| e.to_string())?;
    let mut records = Vec::new();

    for (line_no, line) in text.lines().enumerate() {
        if line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.splitn(4, '\t').collect();
        let [date, time, labels, message] = fields.as_slice() else {
            return Err(format!("line {}: expected 4 fields", line_no + 1));
        };

        let timestamp =
            NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%Y-%m-%d %H:%M:%S%.f")
                .map_err(|e| format!("line {}: {}", line_no + 1, e))?
                .and_utc();

        records.push(LogRecord {
            timestamp,
            labels: parse_labels(labels).map_err(|e| format!("line {}: {}", line_no + 1, e))?,
            line: unescape(message),
        });
    }

    Ok(records)
}

fn parse_labels(text: &str) -> Result<BTreeMap<String, String>, String> {
    let inner = text
        .strip_prefix('{')
        .and_then(|t| t.strip_suffix('}'))
        .ok_or_else(|| format!("malformed label set '{}'", text))?;

    let mut labels = BTreeMap::new();
    let mut chars = inner.chars().peekable();

    while chars.peek().is_some() {
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if chars.next() != Some('"') {
            return Err(format!("label '{}' has no quoted value", key));
        }

        let mut value = String::new();
        loop {
            match chars.next() {
                Some('\\') => match chars.next() {
                    Some('t') => value.push('\t'),
                    Some('n') => value.push('\n'),
                    Some('r') => value.push('\r'),
                    Some(other) => value.push(other),
                    None => return Err("dangling escape".to_string()),
                },
                Some('"') => break,
                Some(c) => value.push(c),
                None => return Err(format!("unterminated value for label '{}'", key)),
            }
        }

        labels.insert(key, value);
        if chars.peek() == Some(&',') {
            chars.next();
        }
    }

    Ok(labels)
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
