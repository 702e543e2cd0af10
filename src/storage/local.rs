use super::traits::{StorageError, StorageSink};
use crate::encode::EncodedArtifact;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

const SINK_NAME: &str = "local";

/// Writes artifacts below a root directory, one file per key
#[derive(Debug, Clone)]
pub struct LocalSink {
    root: PathBuf,
}

impl LocalSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path, refusing anything that would escape the root
    pub fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn unavailable(path: &Path, action: &str, e: std::io::Error) -> StorageError {
        StorageError::Unavailable {
            sink: SINK_NAME.to_string(),
            message: format!("failed to {} '{}': {}", action, path.display(), e),
        }
    }
}

#[async_trait]
impl StorageSink for LocalSink {
    fn name(&self) -> &str {
        SINK_NAME
    }

    async fn put(&self, artifact: &EncodedArtifact) -> Result<(), StorageError> {
        let path = self.path_for(&artifact.key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(artifact.key.clone()))?;

        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Self::unavailable(parent, "create directory", e))?;

        // An identical file is already durable; rewriting it changes nothing
        if let Ok(existing) = tokio::fs::read(&path).await {
            if Sha256::digest(&existing) == Sha256::digest(&artifact.bytes) {
                debug!(path = %path.display(), "Artifact already present, skipping write");
                return Ok(());
            }
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp_path = parent.join(format!(".{}.tmp", file_name));

        tokio::fs::write(&tmp_path, &artifact.bytes)
            .await
            .map_err(|e| Self::unavailable(&tmp_path, "write", e))?;

        let file = tokio::fs::File::open(&tmp_path)
            .await
            .map_err(|e| Self::unavailable(&tmp_path, "open", e))?;
        file.sync_all()
            .await
            .map_err(|e| Self::unavailable(&tmp_path, "sync", e))?;

        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| Self::unavailable(&path, "rename into", e))?;

        debug!(path = %path.display(), bytes = artifact.bytes.len(), "Wrote artifact");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn artifact(key: &str, bytes: &[u8]) -> EncodedArtifact {
        EncodedArtifact {
            key: key.to_string(),
            bytes: bytes.to_vec(),
            content_type: "text/plain; charset=utf-8",
            content_encoding: "gzip",
            records: 1,
        }
    }

    #[tokio::test]
    async fn test_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let sink = LocalSink::new(dir.path());

        sink.put(&artifact("job_a/2020/02/job_a-x.log.gz", b"payload"))
            .await
            .unwrap();

        let written = std::fs::read(dir.path().join("job_a/2020/02/job_a-x.log.gz")).unwrap();
        assert_eq!(written, b"payload");
    }

    #[tokio::test]
    async fn test_put_is_idempotent_and_overwrites() {
        let dir = TempDir::new().unwrap();
        let sink = LocalSink::new(dir.path());
        let key = "job_a/2020/02/job_a-x.log.gz";

        sink.put(&artifact(key, b"one")).await.unwrap();
        sink.put(&artifact(key, b"one")).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join(key)).unwrap(), b"one");

        sink.put(&artifact(key, b"two")).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join(key)).unwrap(), b"two");

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("job_a/2020/02"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1, "no temporary files are left behind");
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let sink = LocalSink::new(dir.path());

        for key in ["../outside.gz", "/etc/passwd", ""] {
            assert!(matches!(
                sink.put(&artifact(key, b"x")).await,
                Err(StorageError::InvalidKey(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_unwritable_root_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let sink = LocalSink::new(&blocker);

        assert!(matches!(
            sink.put(&artifact("job_a/x.gz", b"x")).await,
            Err(StorageError::Unavailable { .. })
        ));
    }
}
