//! Opaque blob handles.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque reference to an object in the blob store.
///
/// A handle carries only what is needed to locate the object
/// (`bucket/key`). It is not a presigned URL and never expires;
/// short-lived read URLs are generated on demand by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct BlobHandle(pub String);

impl BlobHandle {
    /// Create a handle from a bucket and key.
    pub fn new(bucket: impl AsRef<str>, key: impl AsRef<str>) -> Self {
        Self(format!("{}/{}", bucket.as_ref(), key.as_ref()))
    }

    /// Create from an existing opaque string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into `(bucket, key)`. Returns `None` for malformed handles.
    pub fn parts(&self) -> Option<(&str, &str)> {
        self.0.split_once('/')
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_parts() {
        let handle = BlobHandle::new("recap-media", "sources/abc.mp4");
        assert_eq!(handle.parts(), Some(("recap-media", "sources/abc.mp4")));
    }

    #[test]
    fn test_handle_malformed() {
        let handle = BlobHandle::from_string("no-separator");
        assert!(handle.parts().is_none());
    }
}
