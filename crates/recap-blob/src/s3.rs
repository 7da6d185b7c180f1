//! S3-compatible blob store client.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use recap_models::BlobHandle;

use crate::error::{BlobError, BlobResult};
use crate::store::{BlobStore, ObjectInfo};

/// Configuration for the S3-compatible client.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3 API endpoint URL
    pub endpoint_url: String,
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Bucket name
    pub bucket_name: String,
    /// Region ("auto" for R2-style endpoints)
    pub region: String,
}

impl S3Config {
    /// Create config from environment variables.
    pub fn from_env() -> BlobResult<Self> {
        Ok(Self {
            endpoint_url: std::env::var("BLOB_ENDPOINT_URL")
                .map_err(|_| BlobError::config_error("BLOB_ENDPOINT_URL not set"))?,
            access_key_id: std::env::var("BLOB_ACCESS_KEY_ID")
                .map_err(|_| BlobError::config_error("BLOB_ACCESS_KEY_ID not set"))?,
            secret_access_key: std::env::var("BLOB_SECRET_ACCESS_KEY")
                .map_err(|_| BlobError::config_error("BLOB_SECRET_ACCESS_KEY not set"))?,
            bucket_name: std::env::var("BLOB_BUCKET_NAME")
                .map_err(|_| BlobError::config_error("BLOB_BUCKET_NAME not set"))?,
            region: std::env::var("BLOB_REGION").unwrap_or_else(|_| "auto".to_string()),
        })
    }
}

/// S3-compatible [`BlobStore`].
#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    /// Create a new client from configuration.
    pub async fn new(config: S3Config) -> BlobResult<Self> {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "recap",
        );

        let sdk_config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint_url)
            .region(Region::new(config.region))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(sdk_config),
            bucket: config.bucket_name,
        })
    }

    /// Create from environment variables.
    pub async fn from_env() -> BlobResult<Self> {
        Self::new(S3Config::from_env()?).await
    }

    /// Resolve a handle into `(bucket, key)`, validating shape.
    fn resolve<'a>(&self, handle: &'a BlobHandle) -> BlobResult<(&'a str, &'a str)> {
        handle
            .parts()
            .ok_or_else(|| BlobError::invalid_handle(handle.as_str()))
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> BlobResult<BlobHandle> {
        debug!("Uploading {} bytes to {}", data.len(), key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| BlobError::upload_failed(e.to_string()))?;

        info!("Uploaded object {}", key);
        Ok(BlobHandle::new(&self.bucket, key))
    }

    async fn get_object(&self, handle: &BlobHandle) -> BlobResult<Vec<u8>> {
        let (bucket, key) = self.resolve(handle)?;
        debug!("Downloading {}", handle);

        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.to_string().contains("NoSuchKey") {
                    BlobError::not_found(handle.as_str())
                } else {
                    BlobError::download_failed(e.to_string())
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| BlobError::download_failed(e.to_string()))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn head_object(&self, handle: &BlobHandle) -> BlobResult<ObjectInfo> {
        let (bucket, key) = self.resolve(handle)?;

        let response = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.to_string().contains("NotFound") {
                    BlobError::not_found(handle.as_str())
                } else {
                    BlobError::download_failed(e.to_string())
                }
            })?;

        Ok(ObjectInfo {
            size_bytes: response.content_length().unwrap_or(0) as u64,
            content_type: response.content_type().map(String::from),
        })
    }

    async fn presign_get(&self, handle: &BlobHandle, ttl: Duration) -> BlobResult<String> {
        let (bucket, key) = self.resolve(handle)?;

        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| BlobError::PresignFailed(e.to_string()))?;

        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| BlobError::PresignFailed(e.to_string()))?;

        Ok(request.uri().to_string())
    }

    async fn delete(&self, handle: &BlobHandle) -> BlobResult<()> {
        let (bucket, key) = self.resolve(handle)?;

        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BlobError::DeleteFailed(e.to_string()))?;

        debug!("Deleted object {}", handle);
        Ok(())
    }
}
