//! Turns a fetched [`RecordBatch`] into a compressed, addressable artifact.
//!
//! Encoding is deterministic: the same batch always produces the same bytes
//! under the same key, which is what makes re-committing a window after a
//! crash safe.

pub mod elf;
pub mod json;

use crate::config::types::ExportFormat;
use crate::source::{RecordBatch, TimeWindow};
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use thiserror::Error;

pub const CONTENT_ENCODING: &str = "gzip";

#[derive(Debug, Error)]
pub enum EncodeError {
    /// A record cannot be represented in the target format
    #[error("record {index} cannot be encoded: {reason}")]
    MalformedRecord { index: usize, reason: String },

    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedArtifact {
    pub key: String,
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub content_encoding: &'static str,
    pub records: usize,
}

/// Serialize a batch without compressing it
pub fn encode(batch: &RecordBatch, format: ExportFormat) -> Result<Vec<u8>, EncodeError> {
    match format {
        ExportFormat::Elf => elf::encode(batch),
        ExportFormat::Json => json::encode(batch),
    }
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>, EncodeError> {
    // The default gzip header carries mtime 0, so output depends on input only
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, EncodeError> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// Storage key for one window: `{slug}/{YYYY}/{MM}/{slug}-{start}_{end}.{ext}.gz`
pub fn artifact_key(slug: &str, window: &TimeWindow, format: ExportFormat) -> String {
    format!(
        "{slug}/{year}/{month}/{slug}-{start}_{end}.{ext}.gz",
        slug = slug,
        year = window.start.format("%Y"),
        month = window.start.format("%m"),
        start = key_timestamp(window.start),
        end = key_timestamp(window.end),
        ext = format.extension(),
    )
}

fn key_timestamp(ts: DateTime<Utc>) -> String {
    // %.f only prints a fraction when there is one
    ts.format("%Y%m%dT%H%M%S%.fZ").to_string()
}

pub fn build_artifact(
    slug: &str,
    window: &TimeWindow,
    batch: &RecordBatch,
    format: ExportFormat,
) -> Result<EncodedArtifact, EncodeError> {
    let encoded = encode(batch, format)?;
    let bytes = compress(&encoded)?;

    Ok(EncodedArtifact {
        key: artifact_key(slug, window, format),
        bytes,
        content_type: format.content_type(),
        content_encoding: CONTENT_ENCODING,
        records: batch.len(),
    })
}
