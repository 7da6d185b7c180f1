//! Blob store error types.

use thiserror::Error;

/// Result type for blob operations.
pub type BlobResult<T> = Result<T, BlobError>;

/// Errors that can occur during blob operations.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Failed to configure blob store client: {0}")]
    ConfigError(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("Presign failed: {0}")]
    PresignFailed(String),
}

impl BlobError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn not_found(handle: impl Into<String>) -> Self {
        Self::NotFound(handle.into())
    }

    pub fn invalid_handle(handle: impl Into<String>) -> Self {
        Self::InvalidHandle(handle.into())
    }

    pub fn upload_failed(msg: impl Into<String>) -> Self {
        Self::UploadFailed(msg.into())
    }

    pub fn download_failed(msg: impl Into<String>) -> Self {
        Self::DownloadFailed(msg.into())
    }

    /// Whether the failure is worth retrying through the call gate.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BlobError::UploadFailed(_) | BlobError::DownloadFailed(_) | BlobError::DeleteFailed(_)
        )
    }
}
