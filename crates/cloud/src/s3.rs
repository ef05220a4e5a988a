//! S3 (and S3-compatible) backend.

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;

use crate::{public_url, ObjectStorage, StorageError};

/// Uploads objects to one bucket.
///
/// Credentials and region come from the standard AWS environment chain.
#[derive(Clone)]
pub struct S3Storage {
    client: aws_sdk_s3::Client,
    bucket: String,
    public_base_url: String,
}

impl S3Storage {
    /// Build a client for `bucket`.
    ///
    /// * `endpoint` - custom endpoint for S3-compatible stores (MinIO, R2);
    ///   path-style addressing is used when set.
    /// * `public_base_url` - prefix for returned links, e.g. a CDN origin.
    pub async fn connect(
        bucket: String,
        endpoint: Option<String>,
        public_base_url: String,
    ) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = &endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(endpoint.is_some())
            .build();

        tracing::info!(bucket = %bucket, endpoint = ?endpoint, "S3 storage configured");

        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket,
            public_base_url,
        }
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StorageError::Upload {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        tracing::debug!(bucket = %self.bucket, key, size, "Uploaded object");
        Ok(public_url(&self.public_base_url, key))
    }
}
