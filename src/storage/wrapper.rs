//! Uniform handle around a concrete provider
//!
//! The wrapper answers capability questions (nominal table for the backend
//! kind, overridden by whatever the capability cache has observed for this
//! instance) and refuses bucket calls the instance cannot serve before any
//! I/O happens.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::capability::{nominal_capabilities, CapabilityCache, StorageCapability};
use super::error::{StorageError, StorageResult};
use super::{BucketProvider, ContentReader, ContentSource, StorageProvider, UploadRequest};
use crate::models::{BucketInfo, BucketRecord, OperationResult, ProviderKind, UploadResult};
use crate::utils::security::normalize_storage_path;

#[derive(Clone)]
pub struct ProviderWrapper {
    provider: Arc<dyn StorageProvider>,
    capabilities: Arc<CapabilityCache>,
}

impl std::fmt::Debug for ProviderWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderWrapper")
            .field("kind", &self.provider.kind())
            .field("name", &self.provider.name())
            .field("instance_key", &self.provider.instance_key())
            .finish()
    }
}

impl ProviderWrapper {
    pub fn new(provider: Arc<dyn StorageProvider>, capabilities: Arc<CapabilityCache>) -> Self {
        Self { provider, capabilities }
    }

    pub fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.provider
    }

    pub fn kind(&self) -> ProviderKind {
        self.provider.kind()
    }

    pub fn name(&self) -> &str {
        self.provider.name()
    }

    pub fn instance_key(&self) -> &str {
        self.provider.instance_key()
    }

    /// Cached override first, nominal table for the kind otherwise.
    pub fn supports_capability(&self, capability: StorageCapability) -> bool {
        match self.capabilities.get(self.instance_key(), capability) {
            Some(supported) => supported,
            None => nominal_capabilities(self.kind()).contains(&capability),
        }
    }

    /// Every capability currently answered with `true`.
    pub fn supported_capabilities(&self) -> Vec<StorageCapability> {
        nominal_capabilities(self.kind())
            .iter()
            .copied()
            .filter(|capability| self.supports_capability(*capability))
            .collect()
    }

    /// Key the backend uses to look a persisted bucket up: the normalized
    /// path for hierarchical stores, the bucket name for object storage.
    pub fn bucket_search_key(&self, bucket: &BucketRecord) -> String {
        if self.kind().is_object_storage() {
            return bucket.name.clone();
        }
        normalize_storage_path(&bucket.path).unwrap_or_else(|_| bucket.path.clone())
    }

    pub async fn initialize(&self) -> StorageResult<()> {
        self.provider.initialize().await
    }

    pub async fn upload(
        &self,
        request: &UploadRequest,
        content: &mut dyn ContentSource,
        cancel: &CancellationToken,
    ) -> UploadResult {
        self.provider.upload(request, content, cancel).await
    }

    pub async fn upload_bytes(&self, storage_path: &str, data: &[u8], cancel: &CancellationToken) -> StorageResult<String> {
        self.provider.upload_bytes(storage_path, data, cancel).await
    }

    pub async fn download(&self, storage_path: &str, cancel: &CancellationToken) -> StorageResult<ContentReader> {
        self.provider.download(storage_path, cancel).await
    }

    pub async fn delete(&self, storage_path: &str, cancel: &CancellationToken) -> StorageResult<()> {
        self.provider.delete(storage_path, cancel).await
    }

    pub async fn exists(&self, storage_path: &str, cancel: &CancellationToken) -> bool {
        self.provider.exists(storage_path, cancel).await
    }

    pub async fn check_exists(&self, storage_path: &str, cancel: &CancellationToken) -> StorageResult<bool> {
        self.provider.check_exists(storage_path, cancel).await
    }

    pub async fn compute_hash(&self, storage_path: &str, cancel: &CancellationToken) -> StorageResult<String> {
        self.provider.compute_hash(storage_path, cancel).await
    }

    pub async fn test_connection(&self, cancel: &CancellationToken) -> OperationResult {
        self.provider.test_connection(cancel).await
    }

    fn bucket_provider(&self, capability: StorageCapability) -> StorageResult<&dyn BucketProvider> {
        let provider = self.provider.as_bucket_provider().ok_or_else(|| {
            StorageError::UnsupportedOperation(format!(
                "Provider '{}' ({}) does not support bucket operations",
                self.name(),
                self.kind()
            ))
        })?;

        if !self.supports_capability(capability) {
            debug!("Refusing {} on {}: capability disabled", capability, self.instance_key());
            return Err(StorageError::UnsupportedOperation(format!(
                "Provider '{}' does not support {}",
                self.name(),
                capability
            )));
        }
        Ok(provider)
    }

    fn check_nesting(&self, name: &str) -> StorageResult<()> {
        if name.trim_matches('/').contains('/') && !self.supports_capability(StorageCapability::NestedBuckets) {
            return Err(StorageError::UnsupportedOperation(format!(
                "Provider '{}' ({}) does not support nested buckets: '{}'",
                self.name(),
                self.kind(),
                name
            )));
        }
        Ok(())
    }

    pub async fn list_buckets(&self, cancel: &CancellationToken) -> StorageResult<Vec<BucketInfo>> {
        self.bucket_provider(StorageCapability::BucketListing)?
            .list_buckets(cancel)
            .await
    }

    pub async fn bucket_exists(&self, name: &str, cancel: &CancellationToken) -> StorageResult<bool> {
        self.bucket_provider(StorageCapability::BucketExistence)?
            .bucket_exists(name, cancel)
            .await
    }

    /// Gate failures (no bucket support, disabled capability, unsupported
    /// nesting) are errors; backend failures come back in the result.
    pub async fn create_bucket(&self, name: &str, cancel: &CancellationToken) -> StorageResult<OperationResult> {
        let provider = self.bucket_provider(StorageCapability::BucketCreation)?;
        self.check_nesting(name)?;
        Ok(provider.create_bucket(name, cancel).await)
    }

    pub async fn remove_bucket(&self, name: &str, force: bool, cancel: &CancellationToken) -> StorageResult<OperationResult> {
        let provider = self.bucket_provider(StorageCapability::BucketDeletion)?;
        self.check_nesting(name)?;
        if force && !self.supports_capability(StorageCapability::ForceDelete) {
            return Err(StorageError::UnsupportedOperation(format!(
                "Provider '{}' does not support force deletion",
                self.name()
            )));
        }
        Ok(provider.remove_bucket(name, force, cancel).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local::FileSystemProvider;
    use crate::models::FileSystemConfig;
    use async_trait::async_trait;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct ObjectOnly;

    #[async_trait]
    impl StorageProvider for ObjectOnly {
        fn kind(&self) -> ProviderKind {
            ProviderKind::S3Compatible
        }
        fn name(&self) -> &str {
            "object-only"
        }
        fn instance_key(&self) -> &str {
            "s3_compatible:object-only"
        }
        async fn initialize(&self) -> StorageResult<()> {
            Ok(())
        }
        async fn upload(&self, request: &UploadRequest, _: &mut dyn ContentSource, _: &CancellationToken) -> UploadResult {
            UploadResult::failed(request.file_name.clone(), "object-only", "not implemented")
        }
        async fn upload_bytes(&self, path: &str, _: &[u8], _: &CancellationToken) -> StorageResult<String> {
            Ok(path.to_string())
        }
        async fn download(&self, path: &str, _: &CancellationToken) -> StorageResult<ContentReader> {
            Err(StorageError::NotFound(path.to_string()))
        }
        async fn delete(&self, _: &str, _: &CancellationToken) -> StorageResult<()> {
            Ok(())
        }
        async fn check_exists(&self, _: &str, _: &CancellationToken) -> StorageResult<bool> {
            Err(StorageError::ConnectionFailure("offline".to_string()))
        }
        async fn test_connection(&self, _: &CancellationToken) -> OperationResult {
            OperationResult::ok("fine")
        }
    }

    fn filesystem(root: &TempDir, cache: Arc<CapabilityCache>) -> ProviderWrapper {
        let provider = FileSystemProvider::new(
            "local",
            "filesystem:wrapper-test",
            FileSystemConfig {
                root_path: root.path().to_string_lossy().to_string(),
                create_directory_if_not_exists: true,
            },
            cache.clone(),
        );
        ProviderWrapper::new(Arc::new(provider), cache)
    }

    #[test]
    fn test_override_beats_nominal_table() {
        let temp = TempDir::new().unwrap();
        let cache = Arc::new(CapabilityCache::new());
        let wrapper = filesystem(&temp, cache.clone());

        assert!(wrapper.supports_capability(StorageCapability::BucketCreation));
        assert!(!wrapper.supports_capability(StorageCapability::BucketLifecycle));

        cache.record_permission_denied(wrapper.instance_key(), StorageCapability::BucketCreation);
        assert!(!wrapper.supports_capability(StorageCapability::BucketCreation));
        assert!(!wrapper.supported_capabilities().contains(&StorageCapability::BucketCreation));
    }

    #[test]
    fn test_bucket_search_key() {
        let temp = TempDir::new().unwrap();
        let wrapper = filesystem(&temp, Arc::new(CapabilityCache::new()));
        let record = BucketRecord {
            id: Uuid::new_v4(),
            provider_id: Uuid::new_v4(),
            name: "Quarterly".to_string(),
            path: "\\finance\\2024\\".to_string(),
        };
        assert_eq!(wrapper.bucket_search_key(&record), "finance/2024");

        let object = ProviderWrapper::new(Arc::new(ObjectOnly), Arc::new(CapabilityCache::new()));
        assert_eq!(object.bucket_search_key(&record), "Quarterly");
    }

    #[tokio::test]
    async fn test_bucket_calls_need_bucket_provider() {
        let wrapper = ProviderWrapper::new(Arc::new(ObjectOnly), Arc::new(CapabilityCache::new()));
        let cancel = CancellationToken::new();

        assert!(matches!(
            wrapper.list_buckets(&cancel).await,
            Err(StorageError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            wrapper.create_bucket("reports", &cancel).await,
            Err(StorageError::UnsupportedOperation(_))
        ));
        assert!(!wrapper.exists("default/x", &cancel).await);
    }

    #[tokio::test]
    async fn test_disabled_capability_short_circuits() {
        let temp = TempDir::new().unwrap();
        let cache = Arc::new(CapabilityCache::new());
        let wrapper = filesystem(&temp, cache.clone());
        let cancel = CancellationToken::new();

        cache.record_permission_denied(wrapper.instance_key(), StorageCapability::BucketDeletion);
        let result = wrapper.remove_bucket("anything", false, &cancel).await;
        assert!(matches!(result, Err(StorageError::UnsupportedOperation(_))));

        let created = wrapper.create_bucket("a/b", &cancel).await.unwrap();
        assert!(created.success, "{}", created.message);
        assert!(temp.path().join("a").join("b").is_dir());
    }
}
