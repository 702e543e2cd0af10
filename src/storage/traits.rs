use crate::encode::EncodedArtifact;
use async_trait::async_trait;

/// Durable "write these bytes under this key" capability.
///
/// `put` must be idempotent: writing the same key with the same bytes again
/// leaves the backend in the same observable state.
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Short backend name used in logs and metric names
    fn name(&self) -> &str;

    async fn put(&self, artifact: &EncodedArtifact) -> Result<(), StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend '{sink}' unavailable: {message}")]
    Unavailable { sink: String, message: String },

    #[error("invalid storage key '{0}'")]
    InvalidKey(String),
}
