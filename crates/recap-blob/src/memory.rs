//! In-memory blob store for tests and single-process deployments.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use recap_models::BlobHandle;

use crate::error::{BlobError, BlobResult};
use crate::store::{BlobStore, ObjectInfo};

struct StoredObject {
    data: Vec<u8>,
    content_type: String,
}

/// In-memory [`BlobStore`].
pub struct MemoryBlobStore {
    bucket: String,
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl MemoryBlobStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Seed an object directly; returns its handle. Test helper.
    pub async fn seed(&self, key: &str, data: Vec<u8>, content_type: &str) -> BlobHandle {
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
        BlobHandle::new(&self.bucket, key)
    }

    fn key_of<'a>(&self, handle: &'a BlobHandle) -> BlobResult<&'a str> {
        let (bucket, key) = handle
            .parts()
            .ok_or_else(|| BlobError::invalid_handle(handle.as_str()))?;
        if bucket != self.bucket {
            return Err(BlobError::not_found(handle.as_str()));
        }
        Ok(key)
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new("recap-media")
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> BlobResult<BlobHandle> {
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
        Ok(BlobHandle::new(&self.bucket, key))
    }

    async fn get_object(&self, handle: &BlobHandle) -> BlobResult<Vec<u8>> {
        let key = self.key_of(handle)?;
        let objects = self.objects.read().await;
        objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| BlobError::not_found(handle.as_str()))
    }

    async fn head_object(&self, handle: &BlobHandle) -> BlobResult<ObjectInfo> {
        let key = self.key_of(handle)?;
        let objects = self.objects.read().await;
        objects
            .get(key)
            .map(|o| ObjectInfo {
                size_bytes: o.data.len() as u64,
                content_type: Some(o.content_type.clone()),
            })
            .ok_or_else(|| BlobError::not_found(handle.as_str()))
    }

    async fn presign_get(&self, handle: &BlobHandle, ttl: Duration) -> BlobResult<String> {
        let key = self.key_of(handle)?;
        let objects = self.objects.read().await;
        if !objects.contains_key(key) {
            return Err(BlobError::not_found(handle.as_str()));
        }
        Ok(format!(
            "memory://{}/{}?expires_in={}",
            self.bucket,
            key,
            ttl.as_secs()
        ))
    }

    async fn delete(&self, handle: &BlobHandle) -> BlobResult<()> {
        let key = self.key_of(handle)?.to_string();
        self.objects.write().await.remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = MemoryBlobStore::default();
        let handle = store
            .put_object("audio/0.mp3", vec![1, 2, 3], "audio/mpeg")
            .await
            .unwrap();

        let data = store.get_object(&handle).await.unwrap();
        assert_eq!(data, vec![1, 2, 3]);

        let info = store.head_object(&handle).await.unwrap();
        assert_eq!(info.size_bytes, 3);
        assert_eq!(info.content_type.as_deref(), Some("audio/mpeg"));
    }

    #[tokio::test]
    async fn test_missing_object() {
        let store = MemoryBlobStore::default();
        let handle = BlobHandle::new("recap-media", "nope");
        assert!(matches!(
            store.get_object(&handle).await,
            Err(BlobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_presign_requires_existing_object() {
        let store = MemoryBlobStore::default();
        let handle = store
            .put_object("out.mp4", vec![0], "video/mp4")
            .await
            .unwrap();

        let url = store
            .presign_get(&handle, Duration::from_secs(300))
            .await
            .unwrap();
        assert!(url.contains("expires_in=300"));

        store.delete(&handle).await.unwrap();
        assert!(store.presign_get(&handle, Duration::from_secs(300)).await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_bucket_rejected() {
        let store = MemoryBlobStore::new("bucket-a");
        let handle = BlobHandle::new("bucket-b", "key");
        assert!(store.get_object(&handle).await.is_err());
    }
}
