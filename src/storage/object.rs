use super::traits::{StorageError, StorageSink};
use crate::config::types::ObjectStoreConfig;
use crate::encode::EncodedArtifact;
use crate::retry::{RetryError, RetryPolicy, Retryable};
use async_trait::async_trait;
use opendal::services::S3;
use opendal::Operator;
use std::future::IntoFuture;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const SINK_NAME: &str = "object_store";

#[derive(Debug, Error)]
enum PutError {
    #[error(transparent)]
    Store(#[from] opendal::Error),

    #[error("upload timed out after {0:?}")]
    Timeout(Duration),
}

impl Retryable for PutError {
    fn is_retryable(&self) -> bool {
        match self {
            // 5xx, throttling and transport failures; access denied and missing buckets are not
            PutError::Store(e) => e.is_temporary(),
            PutError::Timeout(_) => true,
        }
    }
}

/// S3 or S3-compatible bucket, requests signed with SigV4 when credentials
/// are configured. Keys are written path-style under `{endpoint}/{bucket}/`.
///
/// PutObject replaces the whole object, so repeating a write is harmless.
#[derive(Debug)]
pub struct ObjectStoreSink {
    operator: Operator,
    bucket: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl ObjectStoreSink {
    pub fn new(config: &ObjectStoreConfig) -> Result<Self, StorageError> {
        let bucket = config.bucket.trim_matches('/').to_string();
        let mut builder = S3::default()
            .root("/")
            .bucket(&bucket)
            .endpoint(config.endpoint.trim_end_matches('/'))
            .region(&config.region)
            // Only the configured credentials, never ambient AWS config or instance metadata
            .disable_config_load()
            .disable_ec2_metadata();

        builder = match (&config.access_key_id, &config.secret_access_key) {
            (Some(key_id), Some(secret)) => builder.access_key_id(key_id).secret_access_key(secret),
            _ => builder.allow_anonymous(),
        };

        let operator = Operator::new(builder)
            .map_err(|e| StorageError::Unavailable {
                sink: SINK_NAME.to_string(),
                message: format!("invalid object store configuration: {}", e),
            })?
            .finish();

        Ok(Self {
            operator,
            bucket,
            timeout: config.timeout,
            retry: RetryPolicy::from(&config.retry),
        })
    }

    async fn put_once(&self, artifact: &EncodedArtifact) -> Result<(), PutError> {
        let write = self
            .operator
            .write_with(&artifact.key, artifact.bytes.clone())
            .content_type(artifact.content_type)
            .content_encoding(artifact.content_encoding)
            .into_future();

        match tokio::time::timeout(self.timeout, write).await {
            Ok(result) => result.map(|_| ()).map_err(PutError::from),
            Err(_) => Err(PutError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl StorageSink for ObjectStoreSink {
    fn name(&self) -> &str {
        SINK_NAME
    }

    async fn put(&self, artifact: &EncodedArtifact) -> Result<(), StorageError> {
        if artifact.key.is_empty() || artifact.key.ends_with('/') {
            return Err(StorageError::InvalidKey(artifact.key.clone()));
        }

        self.retry
            .run(SINK_NAME, || self.put_once(artifact))
            .await
            .map_err(|e| {
                let message = match e {
                    RetryError::Exhausted { attempts, last } => {
                        format!("{} after {} attempts", last, attempts)
                    }
                    RetryError::Permanent(e) => e.to_string(),
                };
                StorageError::Unavailable {
                    sink: SINK_NAME.to_string(),
                    message,
                }
            })?;

        debug!(
            bucket = %self.bucket,
            key = %artifact.key,
            bytes = artifact.bytes.len(),
            "Uploaded artifact"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::RetryConfig;
    use opendal::ErrorKind;

    fn config() -> ObjectStoreConfig {
        ObjectStoreConfig {
            endpoint: "https://s3.eu-west-1.amazonaws.com/".to_string(),
            bucket: "/archive/".to_string(),
            region: "eu-west-1".to_string(),
            access_key_id: Some("AKIDEXAMPLE".to_string()),
            secret_access_key: Some("secret".to_string()),
            timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }

    #[test]
    fn test_new_trims_bucket() {
        let sink = ObjectStoreSink::new(&config()).unwrap();
        assert_eq!(sink.bucket, "archive");
        assert_eq!(sink.name(), "object_store");
    }

    #[test]
    fn test_retry_classification() {
        let temporary = opendal::Error::new(ErrorKind::Unexpected, "slow down").set_temporary();
        assert!(PutError::Store(temporary).is_retryable());
        assert!(PutError::Timeout(Duration::from_secs(1)).is_retryable());

        let denied = opendal::Error::new(ErrorKind::PermissionDenied, "access denied");
        assert!(!PutError::Store(denied).is_retryable());
        let missing = opendal::Error::new(ErrorKind::NotFound, "no such bucket");
        assert!(!PutError::Store(missing).is_retryable());
    }
}
