//! Document-facing entry point over the storage manager
//!
//! Document-centric calls report failures inside their result types so a
//! batch can carry on past one bad item. The path-based calls are for
//! internal callers and propagate errors.

use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::models::{DownloadResult, UploadResult};
use crate::storage::{
    ContentReader, ContentSource, ProviderWrapper, StorageManager, StorageResult, UploadRequest,
};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// MIME type derived from the file extension.
pub fn content_type_for(file_name: &str) -> String {
    mime_guess::from_path(Path::new(file_name))
        .first_raw()
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string()
}

#[derive(Clone)]
pub struct FileStorageService {
    manager: Arc<StorageManager>,
}

impl FileStorageService {
    pub fn new(manager: Arc<StorageManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<StorageManager> {
        &self.manager
    }

    async fn provider(&self, provider_id: Option<Uuid>) -> StorageResult<ProviderWrapper> {
        self.manager.resolve(provider_id).await
    }

    /// Store a document on `provider_id` (or the default provider).
    ///
    /// The object key is generated from the document id and file name unless
    /// the request carries one, and the content type is filled in from the
    /// file name when missing.
    pub async fn upload_document(
        &self,
        provider_id: Option<Uuid>,
        mut request: UploadRequest,
        content: &mut dyn ContentSource,
        cancel: &CancellationToken,
    ) -> UploadResult {
        let provider = match self.provider(provider_id).await {
            Ok(provider) => provider,
            Err(e) => {
                error!(
                    provider_id = ?provider_id,
                    object_key = ?request.object_key,
                    bucket = ?request.bucket_name,
                    "No storage provider for document {}: {}",
                    request.document_id,
                    e
                );
                let provider_name = provider_id.map(|id| id.to_string()).unwrap_or_else(|| "default".to_string());
                return UploadResult::failed(request.file_name, provider_name, e.to_string());
            }
        };

        if request.content_type.is_none() {
            request.content_type = Some(content_type_for(&request.file_name));
        }

        let result = provider.upload(&request, content, cancel).await;
        if result.success {
            info!(
                provider_id = ?provider_id,
                "Stored document {} as {}",
                request.document_id,
                result.storage_path.as_deref().unwrap_or_default()
            );
        }
        result
    }

    /// Write bytes at an exact storage path.
    pub async fn upload_bytes(
        &self,
        provider_id: Option<Uuid>,
        storage_path: &str,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> StorageResult<String> {
        self.provider(provider_id)
            .await?
            .upload_bytes(storage_path, data, cancel)
            .await
    }

    /// Open a stored document. Failures land in the result's `error`.
    pub async fn download_document(
        &self,
        provider_id: Option<Uuid>,
        storage_path: &str,
        cancel: &CancellationToken,
    ) -> DownloadResult {
        match self.download_file(provider_id, storage_path, cancel).await {
            Ok(content) => DownloadResult {
                success: true,
                storage_path: storage_path.to_string(),
                content_type: Some(content_type_for(storage_path)),
                content: Some(content),
                error: None,
            },
            Err(e) => {
                error!(
                    provider_id = ?provider_id,
                    object_key = %storage_path,
                    "Download failed: {}",
                    e
                );
                DownloadResult {
                    success: false,
                    storage_path: storage_path.to_string(),
                    content_type: None,
                    content: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    pub async fn download_file(
        &self,
        provider_id: Option<Uuid>,
        storage_path: &str,
        cancel: &CancellationToken,
    ) -> StorageResult<ContentReader> {
        self.provider(provider_id).await?.download(storage_path, cancel).await
    }

    pub async fn delete_file(
        &self,
        provider_id: Option<Uuid>,
        storage_path: &str,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        self.provider(provider_id).await?.delete(storage_path, cancel).await
    }

    /// `false` when the provider cannot be resolved or the probe fails.
    pub async fn file_exists(&self, provider_id: Option<Uuid>, storage_path: &str, cancel: &CancellationToken) -> bool {
        match self.provider(provider_id).await {
            Ok(provider) => provider.exists(storage_path, cancel).await,
            Err(e) => {
                debug!(provider_id = ?provider_id, "Existence check without provider: {}", e);
                false
            }
        }
    }

    pub async fn compute_hash(
        &self,
        provider_id: Option<Uuid>,
        storage_path: &str,
        cancel: &CancellationToken,
    ) -> StorageResult<String> {
        self.provider(provider_id).await?.compute_hash(storage_path, cancel).await
    }
}
