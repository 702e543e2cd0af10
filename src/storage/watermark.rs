use crate::source::from_nanos;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum WatermarkError {
    #[error("state file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file '{path}' is not a JSON object of timestamps: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("state file has invalid timestamp '{value}' for '{identity}'")]
    InvalidTimestamp { identity: String, value: String },

    #[error("refusing to move watermark for '{identity}' back from {current} to {requested}")]
    Regression {
        identity: String,
        current: DateTime<Utc>,
        requested: DateTime<Utc>,
    },
}

pub type Result<T> = std::result::Result<T, WatermarkError>;

/// Durable mapping from exporter identity to the end of its last committed window
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(&self, identity: &str) -> Result<Option<DateTime<Utc>>>;

    /// Record that everything before `to` is exported. Never moves backwards.
    async fn advance(&self, identity: &str, to: DateTime<Utc>) -> Result<()>;
}

fn check_monotonic(
    identity: &str,
    current: Option<DateTime<Utc>>,
    requested: DateTime<Utc>,
) -> Result<()> {
    match current {
        Some(current) if requested < current => Err(WatermarkError::Regression {
            identity: identity.to_string(),
            current,
            requested,
        }),
        _ => Ok(()),
    }
}

/// JSON state file: `{"<query>": "<RFC 3339 timestamp>", ...}`.
///
/// The whole map is read once on open and rewritten (temp file + rename) on
/// every advance.
pub struct FileWatermarkStore {
    path: PathBuf,
    state: Mutex<BTreeMap<String, DateTime<Utc>>>,
}

impl FileWatermarkStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let state = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => parse_state(&path, &content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No state file found, starting fresh");
                BTreeMap::new()
            }
            Err(source) => return Err(WatermarkError::Io { path, source }),
        };

        tracing::info!(
            path = %path.display(),
            exporters = state.len(),
            "Loaded watermark state"
        );

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> BTreeMap<String, DateTime<Utc>> {
        self.state.lock().await.clone()
    }

    async fn persist(&self, state: &BTreeMap<String, DateTime<Utc>>) -> Result<()> {
        let serialized: BTreeMap<&str, String> = state
            .iter()
            .map(|(k, v)| (k.as_str(), v.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
            .collect();
        let json = serde_json::to_string_pretty(&serialized).map_err(|source| WatermarkError::Json {
            path: self.path.clone(),
            source,
        })?;

        let io_err = |source| WatermarkError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        tokio::fs::write(&tmp_path, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp_path, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}

fn parse_state(path: &Path, content: &str) -> Result<BTreeMap<String, DateTime<Utc>>> {
    let raw: BTreeMap<String, String> =
        serde_json::from_str(content).map_err(|source| WatermarkError::Json {
            path: path.to_path_buf(),
            source,
        })?;

    raw.into_iter()
        .map(|(identity, value)| match parse_timestamp(&value) {
            Some(ts) => Ok((identity, ts)),
            None => Err(WatermarkError::InvalidTimestamp { identity, value }),
        })
        .collect()
}

/// RFC 3339, or the bare nanosecond epoch strings older state files contain
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        return value.parse::<i64>().ok().and_then(from_nanos);
    }
    None
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn get(&self, identity: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state.lock().await.get(identity).copied())
    }

    async fn advance(&self, identity: &str, to: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        check_monotonic(identity, state.get(identity).copied(), to)?;

        let mut updated = state.clone();
        updated.insert(identity.to_string(), to);
        self.persist(&updated).await?;

        // Only reflect the new value in memory once it is on disk
        *state = updated;
        tracing::debug!(exporter = %identity, watermark = %to, "Watermark advanced");
        Ok(())
    }
}

/// Non-durable store, for dry runs and tests
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    state: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: impl IntoIterator<Item = (String, DateTime<Utc>)>) -> Self {
        Self {
            state: Mutex::new(entries.into_iter().collect()),
        }
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn get(&self, identity: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state.lock().await.get(identity).copied())
    }

    async fn advance(&self, identity: &str, to: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        check_monotonic(identity, state.get(identity).copied(), to)?;
        state.insert(identity.to_string(), to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const QUERY: &str = r#"{job="varlogs"}"#;

    #[tokio::test]
    async fn test_missing_file_is_empty_state() {
        let dir = TempDir::new().unwrap();
        let store = FileWatermarkStore::open(dir.path().join("state.json")).await.unwrap();
        assert!(store.get(QUERY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_advance_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/state.json");
        let ts = Utc.with_ymd_and_hms(2020, 2, 24, 0, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(42);

        let store = FileWatermarkStore::open(&path).await.unwrap();
        store.advance(QUERY, ts).await.unwrap();
        drop(store);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("2020-02-24T00:00:00.000000042Z"), "{}", content);

        let reopened = FileWatermarkStore::open(&path).await.unwrap();
        assert_eq!(reopened.get(QUERY).await.unwrap(), Some(ts));
    }

    #[tokio::test]
    async fn test_regression_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FileWatermarkStore::open(dir.path().join("state.json")).await.unwrap();
        let later = Utc.with_ymd_and_hms(2020, 2, 24, 0, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2020, 2, 23, 0, 0, 0).unwrap();

        store.advance(QUERY, later).await.unwrap();
        store.advance(QUERY, later).await.unwrap();
        assert!(matches!(
            store.advance(QUERY, earlier).await,
            Err(WatermarkError::Regression { .. })
        ));
        assert_eq!(store.get(QUERY).await.unwrap(), Some(later));
    }

    #[tokio::test]
    async fn test_reads_legacy_nanosecond_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"job_varlogs": "1582502400000000000"}"#).unwrap();

        let store = FileWatermarkStore::open(&path).await.unwrap();
        assert_eq!(
            store.get("job_varlogs").await.unwrap(),
            Some(Utc.with_ymd_and_hms(2020, 2, 24, 0, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_invalid_timestamp_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"job_varlogs": "yesterday"}"#).unwrap();

        assert!(matches!(
            FileWatermarkStore::open(&path).await,
            Err(WatermarkError::InvalidTimestamp { .. })
        ));
    }
}
