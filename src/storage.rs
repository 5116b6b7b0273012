//! C2 — Object Store Adapter: S3-compatible blob store with presigned GETs (§4.2).

use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use std::time::Duration;

use crate::errors::SafeDisplay;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object store unavailable: {0}")]
    Unavailable(String),
    #[error("object store denied the request: {0}")]
    Denied(String),
}

impl SafeDisplay for StorageError {
    fn to_safe_string(&self) -> String {
        match self {
            StorageError::Unavailable(_) => "artifact storage is temporarily unavailable".to_string(),
            StorageError::Denied(_) => "artifact storage denied the request".to_string(),
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn ensure_bucket(&self) -> Result<(), StorageError>;
    async fn put_object(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, StorageError>;
    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(bucket: String, endpoint_url: Option<String>, region: String) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region));
        if let Some(endpoint) = endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let shared_config = loader.load().await;
        let mut s3_builder = aws_sdk_s3::config::Builder::from(&shared_config);
        s3_builder.set_force_path_style(Some(true));
        let client = aws_sdk_s3::Client::from_conf(s3_builder.build());
        Self { client, bucket }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        let exists = self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok();

        if exists {
            return Ok(());
        }

        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map(|_| ())
            .or_else(|err| {
                // Racing creators, or the bucket already existing under another
                // owner, both surface here; treat "already exists" as success.
                let message = err.to_string();
                if message.contains("BucketAlreadyOwnedByYou") || message.contains("BucketAlreadyExists") {
                    Ok(())
                } else {
                    Err(StorageError::Unavailable(message))
                }
            })
    }

    async fn put_object(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, StorageError> {
        let len = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(aws_sdk_s3::primitives::ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| StorageError::Unavailable(err.to_string()))?;

        tracing::debug!(bucket = %self.bucket, key, bytes = len, "uploaded artifact");
        Ok(format!("{}/{}", self.bucket, key))
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let presign_config = PresigningConfig::expires_in(ttl)
            .map_err(|err| StorageError::Unavailable(err.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presign_config)
            .await
            .map_err(|err| StorageError::Unavailable(err.to_string()))?;

        Ok(presigned.uri().to_string())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| StorageError::Unavailable(err.to_string()))?;
        Ok(())
    }
}
