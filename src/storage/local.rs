//! Local filesystem storage provider

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use super::capability::{CapabilityCache, StorageCapability};
use super::error::{StorageError, StorageResult};
use super::hashing::hash_and_rewind;
use super::keys::{compose_storage_path, resolve_object_key};
use super::{bucket_failure, cancellable, BucketProvider, ContentReader, ContentSource, StorageProvider, UploadRequest};
use crate::models::{BucketInfo, FileSystemConfig, OperationResult, ProviderKind, UploadResult};
use crate::utils::security::{normalize_storage_path, resolve_within_root, validate_bucket_name};

/// Filesystem provider rooted at a configured directory.
pub struct FileSystemProvider {
    name: String,
    instance_key: String,
    root: PathBuf,
    create_root: bool,
    capabilities: Arc<CapabilityCache>,
}

impl FileSystemProvider {
    pub fn new(
        name: impl Into<String>,
        instance_key: impl Into<String>,
        config: FileSystemConfig,
        capabilities: Arc<CapabilityCache>,
    ) -> Self {
        Self {
            name: name.into(),
            instance_key: instance_key.into(),
            root: PathBuf::from(config.root_path),
            create_root: config.create_directory_if_not_exists,
            capabilities,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a storage path onto disk, refusing anything that escapes the root.
    pub fn resolve_path(&self, storage_path: &str) -> StorageResult<PathBuf> {
        let normalized = normalize_storage_path(storage_path)?;
        resolve_within_root(&self.root, &normalized)
    }

    fn bucket_path(&self, name: &str) -> StorageResult<PathBuf> {
        validate_bucket_name(name, true)?;
        resolve_within_root(&self.root, name.trim_matches('/'))
    }

    async fn write_content(
        &self,
        path: &Path,
        content: &mut dyn ContentSource,
        cancel: &CancellationToken,
    ) -> StorageResult<u64> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(path).await?;
        let copied = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
            copied = tokio::io::copy(content, &mut file) => copied.map_err(StorageError::from),
        };

        let result = match copied {
            Ok(copied) => file.flush().await.map(|_| copied).map_err(StorageError::from),
            Err(e) => Err(e),
        };
        drop(file);

        if result.is_err() {
            // Leave no partial object behind.
            if let Err(e) = fs::remove_file(path).await {
                debug!("Could not remove partial file {}: {}", path.display(), e);
            }
        }
        result
    }

    async fn store(
        &self,
        request: &UploadRequest,
        content: &mut dyn ContentSource,
        cancel: &CancellationToken,
    ) -> StorageResult<UploadResult> {
        let (content_hash, size) = cancellable(cancel, hash_and_rewind(content)).await?;
        let key = resolve_object_key(request.object_key.as_deref(), &request.document_id, &request.file_name)?;
        let storage_path = compose_storage_path(request.bucket_name.as_deref(), &key.object_key)?;
        let file_path = self.resolve_path(&storage_path)?;

        let written = self.write_content(&file_path, content, cancel).await?;
        if written != size {
            warn!(
                "Upload of {} wrote {} bytes but hashed {}; content changed during transfer",
                storage_path, written, size
            );
        }

        info!("Stored document locally: {}", file_path.display());
        Ok(UploadResult::succeeded(
            storage_path,
            key.file_id,
            request.file_name.clone(),
            request.content_type.clone(),
            size,
            content_hash,
            self.name.clone(),
        ))
    }

    async fn create_bucket_inner(&self, name: &str) -> StorageResult<()> {
        let path = self.bucket_path(name)?;
        if fs::try_exists(&path).await? {
            return Err(StorageError::Validation(format!("Bucket '{}' already exists", name)));
        }
        fs::create_dir_all(&path).await?;
        Ok(())
    }

    async fn remove_bucket_inner(&self, name: &str, force: bool) -> StorageResult<()> {
        let path = self.bucket_path(name)?;
        if !fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(format!("Bucket '{}' does not exist", name)));
        }

        let mut entries = fs::read_dir(&path).await?;
        let is_empty = entries.next_entry().await?.is_none();

        if !is_empty && !force {
            return Err(StorageError::Validation(format!(
                "Bucket '{}' is not empty; use force to delete its contents",
                name
            )));
        }

        if is_empty {
            fs::remove_dir(&path).await?;
        } else {
            fs::remove_dir_all(&path).await?;
        }
        Ok(())
    }
}

/// Total size and file count below `path`.
fn directory_usage(path: &Path) -> (u64, u64) {
    let mut size = 0u64;
    let mut count = 0u64;
    for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            count += 1;
            size += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    (size, count)
}

#[async_trait]
impl StorageProvider for FileSystemProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::FileSystem
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn instance_key(&self) -> &str {
        &self.instance_key
    }

    fn as_bucket_provider(&self) -> Option<&dyn BucketProvider> {
        Some(self)
    }

    async fn initialize(&self) -> StorageResult<()> {
        if fs::try_exists(&self.root).await? {
            let metadata = fs::metadata(&self.root).await?;
            if !metadata.is_dir() {
                return Err(StorageError::Validation(format!(
                    "Storage root {} is not a directory",
                    self.root.display()
                )));
            }
            return Ok(());
        }

        if !self.create_root {
            return Err(StorageError::NotFound(format!(
                "Storage root {} does not exist",
                self.root.display()
            )));
        }

        if let Err(e) = fs::create_dir_all(&self.root).await {
            error!("Failed to create storage root {:?}: {}", self.root, e);
            return Err(e.into());
        }
        info!("Ensured storage root exists: {:?}", self.root);
        Ok(())
    }

    async fn upload(
        &self,
        request: &UploadRequest,
        content: &mut dyn ContentSource,
        cancel: &CancellationToken,
    ) -> UploadResult {
        match self.store(request, content, cancel).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    provider = %self.instance_key,
                    object_key = ?request.object_key,
                    bucket = ?request.bucket_name,
                    "Local upload of {} failed: {}",
                    request.file_name,
                    e
                );
                UploadResult::failed(request.file_name.clone(), self.name.clone(), e.to_string())
            }
        }
    }

    async fn upload_bytes(&self, storage_path: &str, data: &[u8], cancel: &CancellationToken) -> StorageResult<String> {
        let normalized = normalize_storage_path(storage_path)?;
        let file_path = self.resolve_path(&normalized)?;
        let mut cursor = std::io::Cursor::new(data);
        self.write_content(&file_path, &mut cursor, cancel).await?;
        Ok(normalized)
    }

    async fn download(&self, storage_path: &str, _cancel: &CancellationToken) -> StorageResult<ContentReader> {
        let file_path = self.resolve_path(storage_path)?;
        match fs::File::open(&file_path).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(format!("File not found: {}", storage_path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, storage_path: &str, _cancel: &CancellationToken) -> StorageResult<()> {
        let file_path = self.resolve_path(storage_path)?;
        match fs::remove_file(&file_path).await {
            Ok(_) => {
                info!("Deleted file: {}", file_path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("File already deleted: {}", file_path.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn check_exists(&self, storage_path: &str, _cancel: &CancellationToken) -> StorageResult<bool> {
        let file_path = self.resolve_path(storage_path)?;
        match fs::metadata(&file_path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn test_connection(&self, _cancel: &CancellationToken) -> OperationResult {
        let probe = self.root.join(format!(".docstore-probe-{}", uuid::Uuid::new_v4()));
        let result: StorageResult<()> = async {
            fs::create_dir_all(&self.root).await?;
            fs::write(&probe, b"probe").await?;
            fs::remove_file(&probe).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => OperationResult::ok(format!("Storage root {} is writable", self.root.display())),
            Err(e) => OperationResult::failure(format!(
                "Storage root {} is not usable: {}",
                self.root.display(),
                e
            )),
        }
    }
}

#[async_trait]
impl BucketProvider for FileSystemProvider {
    async fn list_buckets(&self, _cancel: &CancellationToken) -> StorageResult<Vec<BucketInfo>> {
        let mut buckets = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }

            let path = entry.path();
            let (size, count) = tokio::task::spawn_blocking(move || directory_usage(&path)).await?;

            buckets.push(BucketInfo {
                name: entry.file_name().to_string_lossy().to_string(),
                created_at: metadata.created().ok().map(chrono::DateTime::<chrono::Utc>::from),
                size_bytes: Some(size),
                object_count: Some(count),
            });
        }

        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }

    async fn bucket_exists(&self, name: &str, _cancel: &CancellationToken) -> StorageResult<bool> {
        let path = self.bucket_path(name)?;
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_bucket(&self, name: &str, cancel: &CancellationToken) -> OperationResult {
        match cancellable(cancel, self.create_bucket_inner(name)).await {
            Ok(()) => {
                info!("Created bucket directory '{}' under {}", name, self.root.display());
                OperationResult::ok(format!("Bucket '{}' created", name))
            }
            Err(e) => bucket_failure(
                &self.capabilities,
                &self.instance_key,
                StorageCapability::BucketCreation,
                "create",
                name,
                e,
            ),
        }
    }

    async fn remove_bucket(&self, name: &str, force: bool, cancel: &CancellationToken) -> OperationResult {
        match cancellable(cancel, self.remove_bucket_inner(name, force)).await {
            Ok(()) => {
                info!("Removed bucket directory '{}' (force: {})", name, force);
                OperationResult::ok(format!("Bucket '{}' removed", name))
            }
            Err(e) => bucket_failure(
                &self.capabilities,
                &self.instance_key,
                StorageCapability::BucketDeletion,
                "remove",
                name,
                e,
            ),
        }
    }
}
