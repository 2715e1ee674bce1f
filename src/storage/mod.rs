//! Storage provider abstraction for document content
//!
//! This module provides one contract over heterogeneous backends (local
//! filesystem, FTP, SFTP, S3-compatible object storage). Concrete adapters
//! live in their own modules; the [`manager::StorageManager`] owns their
//! lifecycle and hands out [`wrapper::ProviderWrapper`]s.

use async_trait::async_trait;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncSeek};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::models::{BucketInfo, OperationResult, ProviderKind, UploadResult};

pub mod capability;
pub mod error;
pub mod factory;
pub mod hashing;
pub mod keys;
pub mod local;
pub mod manager;
pub mod pool;
pub mod transfer;
pub mod wrapper;

#[cfg(feature = "ftp")]
pub mod ftp;
#[cfg(feature = "s3")]
pub mod s3;
#[cfg(feature = "sftp")]
pub mod sftp;

pub use capability::{CapabilityCache, StorageCapability};
pub use error::{StorageError, StorageResult};
pub use manager::{StorageManager, StorageSettings};
pub use wrapper::ProviderWrapper;

/// Readable, seekable upload content. Hashing rewinds it before transfer.
pub trait ContentSource: AsyncRead + AsyncSeek + Unpin + Send {}

impl<T: AsyncRead + AsyncSeek + Unpin + Send> ContentSource for T {}

/// Stream returned by downloads.
pub type ContentReader = Pin<Box<dyn AsyncRead + Send>>;

/// Parameters of a document-oriented upload.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    /// Explicit object key; derived from document id and file name when absent.
    pub object_key: Option<String>,
    pub file_name: String,
    pub document_id: String,
    pub content_type: Option<String>,
    pub bucket_name: Option<String>,
}

impl UploadRequest {
    pub fn new(document_id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            file_name: file_name.into(),
            ..Default::default()
        }
    }

    pub fn with_bucket(mut self, bucket_name: impl Into<String>) -> Self {
        self.bucket_name = Some(bucket_name.into());
        self
    }

    pub fn with_object_key(mut self, object_key: impl Into<String>) -> Self {
        self.object_key = Some(object_key.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Core contract every storage adapter implements.
///
/// Storage paths are the `{bucket}/{objectKey}` strings returned by uploads.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Human-readable provider name from its configuration record.
    fn name(&self) -> &str;

    /// Identity of this instance, fixed at construction. Capability
    /// overrides are keyed by it.
    fn instance_key(&self) -> &str;

    /// Bucket-capable providers return themselves here.
    fn as_bucket_provider(&self) -> Option<&dyn BucketProvider> {
        None
    }

    /// Validate access and prepare the backend (create root directories, etc.)
    async fn initialize(&self) -> StorageResult<()>;

    /// Hash, then store `content`. Failures are reported in the result.
    async fn upload(
        &self,
        request: &UploadRequest,
        content: &mut dyn ContentSource,
        cancel: &CancellationToken,
    ) -> UploadResult;

    /// Store bytes at an exact storage path. Raises on failure.
    async fn upload_bytes(&self, storage_path: &str, data: &[u8], cancel: &CancellationToken) -> StorageResult<String>;

    async fn download(&self, storage_path: &str, cancel: &CancellationToken) -> StorageResult<ContentReader>;

    /// Idempotent: a missing object is logged, not an error.
    async fn delete(&self, storage_path: &str, cancel: &CancellationToken) -> StorageResult<()>;

    /// Existence probe that keeps transport failures distinct from absence.
    async fn check_exists(&self, storage_path: &str, cancel: &CancellationToken) -> StorageResult<bool>;

    /// Never raises; any failure reads as absent.
    async fn exists(&self, storage_path: &str, cancel: &CancellationToken) -> bool {
        match self.check_exists(storage_path, cancel).await {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    provider = %self.name(),
                    object_key = %storage_path,
                    "Existence check failed, reporting as absent: {}",
                    e
                );
                false
            }
        }
    }

    /// SHA-256 of the stored object, using the same hasher as upload.
    async fn compute_hash(&self, storage_path: &str, cancel: &CancellationToken) -> StorageResult<String> {
        let mut reader = self.download(storage_path, cancel).await?;
        let (hash, _) = hashing::hash_reader(&mut reader).await?;
        Ok(hash)
    }

    async fn test_connection(&self, cancel: &CancellationToken) -> OperationResult;
}

/// Bucket lifecycle, implemented by providers that group objects.
#[async_trait]
pub trait BucketProvider: StorageProvider {
    async fn list_buckets(&self, cancel: &CancellationToken) -> StorageResult<Vec<BucketInfo>>;

    async fn bucket_exists(&self, name: &str, cancel: &CancellationToken) -> StorageResult<bool>;

    /// A permission failure downgrades this instance's `BucketCreation`.
    async fn create_bucket(&self, name: &str, cancel: &CancellationToken) -> OperationResult;

    /// Without `force`, fails on non-empty buckets. A permission failure
    /// downgrades this instance's `BucketDeletion`.
    async fn remove_bucket(&self, name: &str, force: bool, cancel: &CancellationToken) -> OperationResult;
}

/// Shared failure bookkeeping for the bucket lifecycle calls: the permission
/// branch is the only place a capability gets downgraded.
pub(crate) fn bucket_failure(
    capabilities: &CapabilityCache,
    instance_key: &str,
    capability: StorageCapability,
    action: &str,
    bucket: &str,
    err: StorageError,
) -> OperationResult {
    if err.is_permission_denied() {
        capabilities.record_permission_denied(instance_key, capability);
    }
    tracing::error!(
        provider = %instance_key,
        bucket = %bucket,
        "Failed to {} bucket: {}",
        action,
        err
    );
    OperationResult::failure(format!("Failed to {} bucket '{}': {}", action, bucket, err))
}

/// Run a future unless the token fires first.
pub(crate) async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> StorageResult<T>
where
    F: std::future::Future<Output = StorageResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StorageError::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_permission_failures_downgrade() {
        let cache = CapabilityCache::new();

        let result = bucket_failure(
            &cache,
            "ftp:a",
            StorageCapability::BucketDeletion,
            "remove",
            "reports",
            StorageError::Validation("not empty".to_string()),
        );
        assert!(!result.success);
        assert!(result.message.contains("reports"));
        assert!(cache.is_empty());

        bucket_failure(
            &cache,
            "ftp:a",
            StorageCapability::BucketCreation,
            "create",
            "reports",
            StorageError::PermissionDenied("550 Permission denied".to_string()),
        );
        assert_eq!(cache.get("ftp:a", StorageCapability::BucketCreation), Some(false));
        assert_eq!(cache.get("ftp:a", StorageCapability::BucketDeletion), None);
    }

    #[tokio::test]
    async fn test_cancellable_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = cancellable(&cancel, async { Ok::<_, StorageError>(1) }).await;
        assert!(matches!(result, Err(StorageError::Cancelled)));
    }
}
