pub mod error;
pub mod s3;

pub use error::ObjectStoreError;
pub use s3::S3ObjectStore;

use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    pub size_bytes: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
}

/// Typed get/put/head surface with a retry-classified error type.
/// Every failure mode maps one-to-one onto `ErrorKind` so C2 never needs
/// to parse error strings.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Refuses to read the body if the object's declared size exceeds
    /// `max_size_bytes`.
    async fn get(&self, bucket: &str, key: &str, max_size_bytes: u64) -> Result<Bytes, ObjectStoreError>;

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), ObjectStoreError>;

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMetadata>, ObjectStoreError>;
}
