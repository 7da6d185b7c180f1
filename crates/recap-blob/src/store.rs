//! Blob store trait.

use std::time::Duration;

use async_trait::async_trait;

use recap_models::BlobHandle;

use crate::error::BlobResult;

/// Metadata of a stored object.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub size_bytes: u64,
    pub content_type: Option<String>,
}

/// Gateway to the object store holding source media and rendered output.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload an object; returns the opaque handle locating it.
    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> BlobResult<BlobHandle>;

    /// Download the object's bytes.
    async fn get_object(&self, handle: &BlobHandle) -> BlobResult<Vec<u8>>;

    /// Check the object is resident and readable without fetching it.
    async fn head_object(&self, handle: &BlobHandle) -> BlobResult<ObjectInfo>;

    /// Generate a short-lived read URL. Never stored.
    async fn presign_get(&self, handle: &BlobHandle, ttl: Duration) -> BlobResult<String>;

    /// Delete the object.
    async fn delete(&self, handle: &BlobHandle) -> BlobResult<()>;
}
