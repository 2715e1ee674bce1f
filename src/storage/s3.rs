//! S3 and S3-compatible object storage provider

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration, Delete,
    ObjectIdentifier,
};
use aws_sdk_s3::Client;
use aws_types::region::Region as AwsRegion;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::capability::{CapabilityCache, StorageCapability};
use super::error::{classify_error_message, StorageError, StorageResult};
use super::hashing::hash_and_rewind;
use super::keys::{compose_storage_path, resolve_object_key, split_storage_path, DEFAULT_NAMESPACE};
use super::pool::{ClientPool, PoolStats};
use super::{bucket_failure, cancellable, BucketProvider, ContentReader, ContentSource, StorageProvider, UploadRequest};
use crate::models::{BucketInfo, ObjectStorageConfig, OperationResult, ProviderKind, UploadResult};
use crate::utils::security::{normalize_storage_path, validate_bucket_name};

/// Multipart upload chunk size (16MB - AWS minimum is 5MB)
const MULTIPART_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// `DeleteObjects` accepts at most this many keys per request.
const DELETE_BATCH_SIZE: usize = 1000;

const MAX_RETRIES: u32 = 3;
const BASE_DELAY_MS: u64 = 100;

static BUCKET_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$").expect("bucket name pattern is valid"));
static IP_ADDRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{1,3}(\.\d{1,3}){3}$").expect("ip address pattern is valid"));

/// Object storage bucket naming rules.
pub fn validate_s3_bucket_name(name: &str) -> StorageResult<()> {
    validate_bucket_name(name, false)?;

    if !BUCKET_NAME_RE.is_match(name) || name.contains("..") || IP_ADDRESS_RE.is_match(name) {
        return Err(StorageError::Validation(format!(
            "Invalid bucket name '{}': use 3-63 lowercase letters, digits, dots or hyphens",
            name
        )));
    }
    Ok(())
}

/// Map an SDK failure onto the storage taxonomy.
fn map_sdk_error<E>(operation: &str, err: SdkError<E, HttpResponse>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = format!("{} failed: {}", operation, DisplayErrorContext(&err));

    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            return StorageError::ConnectionFailure(message);
        }
        SdkError::ConstructionFailure(_) => return StorageError::Validation(message),
        _ => {}
    }

    match err.code() {
        Some(
            "AccessDenied" | "AllAccessDisabled" | "InvalidAccessKeyId" | "SignatureDoesNotMatch"
            | "AccountProblem",
        ) => return StorageError::PermissionDenied(message),
        Some("NoSuchKey" | "NoSuchBucket" | "NotFound" | "NoSuchUpload") => return StorageError::NotFound(message),
        Some("SlowDown" | "ServiceUnavailable" | "InternalError" | "RequestTimeout") => {
            return StorageError::ConnectionFailure(message)
        }
        Some("BucketAlreadyExists" | "BucketAlreadyOwnedByYou" | "InvalidBucketName" | "BucketNotEmpty") => {
            return StorageError::Validation(message)
        }
        _ => {}
    }

    match err.raw_response().map(|response| response.status().as_u16()) {
        Some(401 | 403) => StorageError::PermissionDenied(message),
        Some(404) => StorageError::NotFound(message),
        Some(status) if status >= 500 => StorageError::ConnectionFailure(message),
        _ => classify_error_message(&message),
    }
}

/// Read up to `limit` bytes, stopping early only at end of stream.
async fn read_part(content: &mut dyn ContentSource, limit: usize) -> StorageResult<Vec<u8>> {
    let mut part = Vec::with_capacity(limit.min(1024 * 1024));
    let mut limited = (&mut *content).take(limit as u64);
    limited.read_to_end(&mut part).await?;
    Ok(part)
}

fn to_chrono(value: &aws_sdk_s3::primitives::DateTime) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp(value.secs(), value.subsec_nanos())
}

/// Provider for AWS S3 (`s3`) and generic S3 API endpoints (`s3_compatible`).
pub struct S3Provider {
    name: String,
    instance_key: String,
    kind: ProviderKind,
    default_bucket: String,
    region: String,
    pool: ClientPool<Client>,
    capabilities: Arc<CapabilityCache>,
}

impl S3Provider {
    pub fn new(
        name: impl Into<String>,
        instance_key: impl Into<String>,
        kind: ProviderKind,
        config: ObjectStorageConfig,
        pool_size: usize,
        timeout: Duration,
        capabilities: Arc<CapabilityCache>,
    ) -> StorageResult<Self> {
        if !kind.is_object_storage() {
            return Err(StorageError::Validation(format!("{} is not an object storage kind", kind)));
        }
        if config.bucket_name.trim().is_empty() {
            return Err(StorageError::Validation("Bucket name is required".to_string()));
        }
        if config.access_key.is_empty() || config.secret_key.is_empty() {
            return Err(StorageError::Validation("Access key and secret key are required".to_string()));
        }

        let credentials = Credentials::new(&config.access_key, &config.secret_key, None, None, "docstore-storage");

        let region = config
            .region
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or("us-east-1")
            .to_string();

        let mut builder = aws_sdk_s3::config::Builder::new()
            .region(AwsRegion::new(region.clone()))
            .credentials_provider(credentials)
            .timeout_config(TimeoutConfig::builder().operation_attempt_timeout(timeout).build())
            .behavior_version_latest();

        if let Some(endpoint_url) = config.endpoint.as_deref().filter(|e| !e.is_empty()) {
            builder = builder.endpoint_url(endpoint_url);
            info!("Using custom S3 endpoint: {}", endpoint_url);
        }
        if kind == ProviderKind::S3Compatible {
            builder = builder.force_path_style(true);
        }

        let sdk_config = builder.build();
        let pool = ClientPool::new(pool_size, move || Ok(Client::from_conf(sdk_config.clone())));

        Ok(Self {
            name: name.into(),
            instance_key: instance_key.into(),
            kind,
            default_bucket: config.bucket_name,
            region,
            pool,
            capabilities,
        })
    }

    pub fn default_bucket(&self) -> &str {
        &self.default_bucket
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Split a storage path into bucket and key. The `default` namespace
    /// maps onto the configured bucket.
    fn locate(&self, storage_path: &str) -> StorageResult<(String, String)> {
        let (bucket, key) = split_storage_path(storage_path)?;
        if bucket == DEFAULT_NAMESPACE {
            Ok((self.default_bucket.clone(), key))
        } else {
            Ok((bucket, key))
        }
    }

    /// Retry wrapper for S3 operations with exponential backoff.
    /// Only transient failures are retried.
    async fn retry_operation<T, F, Fut>(&self, operation_name: &str, operation: F) -> StorageResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = StorageResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        info!("S3 operation '{}' succeeded after {} retries", operation_name, attempt);
                    }
                    return Ok(result);
                }
                Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                    let delay_ms = BASE_DELAY_MS * 2u64.pow(attempt);
                    warn!(
                        "S3 operation '{}' failed (attempt {}/{}), retrying in {}ms: {}",
                        operation_name,
                        attempt + 1,
                        MAX_RETRIES + 1,
                        delay_ms,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
                Err(e) => {
                    if attempt > 0 {
                        error!("S3 operation '{}' failed after {} attempts: {}", operation_name, attempt + 1, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn put_single(
        &self,
        client: &Client,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        data: Vec<u8>,
    ) -> StorageResult<()> {
        let mut request = client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data));
        if let Some(content_type) = content_type {
            request = request.content_type(content_type);
        }
        request.send().await.map_err(|e| map_sdk_error("PutObject", e))?;
        Ok(())
    }

    /// Multipart upload starting with an already read first part. The
    /// upload is aborted if any step fails or the token fires.
    #[allow(clippy::too_many_arguments)]
    async fn put_multipart(
        &self,
        client: &Client,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        first_part: Vec<u8>,
        content: &mut dyn ContentSource,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        let mut create = client.create_multipart_upload().bucket(bucket).key(key);
        if let Some(content_type) = content_type {
            create = create.content_type(content_type);
        }
        let created = create
            .send()
            .await
            .map_err(|e| map_sdk_error("CreateMultipartUpload", e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::Internal("Missing upload ID in multipart upload response".to_string()))?
            .to_string();
        info!("Initiated multipart upload for {}/{}: {}", bucket, key, upload_id);

        let result = self
            .upload_parts(client, bucket, key, &upload_id, first_part, content, cancel)
            .await;

        if let Err(e) = &result {
            warn!("Aborting multipart upload {} for {}/{}: {}", upload_id, bucket, key, e);
            if let Err(abort_err) = client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                error!("Failed to abort multipart upload: {}", DisplayErrorContext(&abort_err));
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_parts(
        &self,
        client: &Client,
        bucket: &str,
        key: &str,
        upload_id: &str,
        first_part: Vec<u8>,
        content: &mut dyn ContentSource,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        let mut completed_parts = Vec::new();
        let mut part = first_part;
        let mut part_number = 1;

        while !part.is_empty() {
            debug!("Uploading part {} for {} ({} bytes)", part_number, key, part.len());
            let send = client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part))
                .send();
            let uploaded = cancellable(cancel, async {
                send.await.map_err(|e| map_sdk_error("UploadPart", e))
            })
            .await?;

            let etag = uploaded
                .e_tag()
                .ok_or_else(|| StorageError::Internal("Missing ETag in upload part response".to_string()))?;
            completed_parts.push(CompletedPart::builder().part_number(part_number).e_tag(etag).build());

            part_number += 1;
            part = cancellable(cancel, read_part(content, MULTIPART_CHUNK_SIZE)).await?;
        }

        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| map_sdk_error("CompleteMultipartUpload", e))?;

        info!("Successfully completed multipart upload for {}", key);
        Ok(())
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
        let (bucket, object_key) = self.locate(&storage_path)?;

        let content_type = request
            .content_type
            .clone()
            .or_else(|| mime_guess::from_path(&request.file_name).first().map(|m| m.to_string()));

        let client = self.pool.acquire(cancel).await?;
        let client: &Client = &client;

        let first_part = cancellable(cancel, read_part(content, MULTIPART_CHUNK_SIZE)).await?;
        if first_part.len() < MULTIPART_CHUNK_SIZE {
            cancellable(
                cancel,
                self.put_single(client, &bucket, &object_key, content_type.as_deref(), first_part),
            )
            .await?;
        } else {
            // Not wrapped: a started multipart upload must reach its abort path.
            self.put_multipart(client, &bucket, &object_key, content_type.as_deref(), first_part, content, cancel)
                .await?;
        }

        info!("Stored document in object storage: {}/{} ({} bytes)", bucket, object_key, size);
        Ok(UploadResult::succeeded(
            storage_path,
            key.file_id,
            request.file_name.clone(),
            content_type,
            size,
            content_hash,
            self.name.clone(),
        ))
    }

    async fn list_keys(&self, client: &Client, bucket: &str, limit: Option<usize>) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let token = continuation_token.clone();
            let response = self
                .retry_operation("list_objects_v2", || {
                    let token = token.clone();
                    async move {
                        let mut request = client.list_objects_v2().bucket(bucket);
                        if let Some(limit) = limit {
                            request = request.max_keys(limit as i32);
                        }
                        if let Some(token) = token {
                            request = request.continuation_token(token);
                        }
                        request.send().await.map_err(|e| map_sdk_error("ListObjectsV2", e))
                    }
                })
                .await?;

            keys.extend(response.contents().iter().filter_map(|o| o.key().map(str::to_string)));

            if limit.is_some_and(|limit| keys.len() >= limit) {
                break;
            }
            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token().map(str::to_string);
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }
        Ok(keys)
    }

    async fn create_bucket_inner(&self, name: &str, cancel: &CancellationToken) -> StorageResult<()> {
        validate_s3_bucket_name(name)?;

        let client = self.pool.acquire(cancel).await?;
        let mut request = client.create_bucket().bucket(name);
        if self.kind == ProviderKind::S3 && self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        cancellable(cancel, async {
            request.send().await.map_err(|e| map_sdk_error("CreateBucket", e))
        })
        .await?;
        Ok(())
    }

    async fn remove_bucket_inner(&self, name: &str, force: bool, cancel: &CancellationToken) -> StorageResult<()> {
        validate_bucket_name(name, false)?;

        let client = self.pool.acquire(cancel).await?;
        let client: &Client = &client;

        cancellable(cancel, async {
            if !force {
                let sample = self.list_keys(client, name, Some(1)).await?;
                if !sample.is_empty() {
                    return Err(StorageError::Validation(format!(
                        "Bucket '{}' is not empty; use force to delete its contents",
                        name
                    )));
                }
            } else {
                let keys = self.list_keys(client, name, None).await?;
                for batch in keys.chunks(DELETE_BATCH_SIZE) {
                    let objects = batch
                        .iter()
                        .map(|key| ObjectIdentifier::builder().key(key).build())
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(StorageError::internal)?;
                    let delete = Delete::builder()
                        .set_objects(Some(objects))
                        .quiet(true)
                        .build()
                        .map_err(StorageError::internal)?;

                    let response = client
                        .delete_objects()
                        .bucket(name)
                        .delete(delete)
                        .send()
                        .await
                        .map_err(|e| map_sdk_error("DeleteObjects", e))?;

                    if let Some(failed) = response.errors().first() {
                        let message = format!(
                            "Failed to delete {} object(s) from '{}', first: {} ({})",
                            response.errors().len(),
                            name,
                            failed.key().unwrap_or_default(),
                            failed.message().unwrap_or_default()
                        );
                        return Err(match failed.code() {
                            Some("AccessDenied") => StorageError::PermissionDenied(message),
                            _ => StorageError::Internal(message),
                        });
                    }
                    debug!("Deleted {} objects from bucket '{}'", batch.len(), name);
                }
            }

            client
                .delete_bucket()
                .bucket(name)
                .send()
                .await
                .map_err(|e| map_sdk_error("DeleteBucket", e))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    fn kind(&self) -> ProviderKind {
        self.kind
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

    /// Configuration is checked at construction; connectivity is left to
    /// `test_connection` so a slow endpoint does not stall registry loads.
    async fn initialize(&self) -> StorageResult<()> {
        debug!(
            "Object storage provider '{}' ready (bucket: {}, region: {})",
            self.name, self.default_bucket, self.region
        );
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
                    "Object storage upload of {} failed: {}",
                    request.file_name,
                    e
                );
                UploadResult::failed(request.file_name.clone(), self.name.clone(), e.to_string())
            }
        }
    }

    async fn upload_bytes(&self, storage_path: &str, data: &[u8], cancel: &CancellationToken) -> StorageResult<String> {
        let normalized = normalize_storage_path(storage_path)?;
        let (bucket, key) = self.locate(&normalized)?;
        let content_type = mime_guess::from_path(&key).first().map(|m| m.to_string());

        let client = self.pool.acquire(cancel).await?;
        let client: &Client = &client;
        let (bucket, key) = (bucket.as_str(), key.as_str());

        cancellable(
            cancel,
            self.retry_operation(&format!("put_object: {}", key), || {
                let content_type = content_type.clone();
                async move {
                    self.put_single(client, bucket, key, content_type.as_deref(), data.to_vec())
                        .await
                }
            }),
        )
        .await?;

        info!("Successfully stored file: {}/{}", bucket, key);
        Ok(normalized)
    }

    async fn download(&self, storage_path: &str, cancel: &CancellationToken) -> StorageResult<ContentReader> {
        let (bucket, key) = self.locate(storage_path)?;
        let client = self.pool.acquire(cancel).await?;
        let client: &Client = &client;
        let (bucket, key) = (bucket.as_str(), key.as_str());

        let response = cancellable(
            cancel,
            self.retry_operation(&format!("get_object: {}", key), || async move {
                client
                    .get_object()
                    .bucket(bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| map_sdk_error("GetObject", e))
            }),
        )
        .await?;

        debug!("Streaming object {}/{}", bucket, key);
        Ok(Box::pin(response.body.into_async_read()))
    }

    async fn delete(&self, storage_path: &str, cancel: &CancellationToken) -> StorageResult<()> {
        let (bucket, key) = self.locate(storage_path)?;
        let client = self.pool.acquire(cancel).await?;
        let client: &Client = &client;
        let (bucket, key) = (bucket.as_str(), key.as_str());

        let result = cancellable(
            cancel,
            self.retry_operation(&format!("delete_object: {}", key), || async move {
                client
                    .delete_object()
                    .bucket(bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| map_sdk_error("DeleteObject", e))
            }),
        )
        .await;

        match result {
            Ok(_) => {
                info!("Deleted object: {}/{}", bucket, key);
                Ok(())
            }
            Err(StorageError::NotFound(_)) => {
                info!("Object already deleted: {}/{}", bucket, key);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn check_exists(&self, storage_path: &str, cancel: &CancellationToken) -> StorageResult<bool> {
        let (bucket, key) = self.locate(storage_path)?;
        let client = self.pool.acquire(cancel).await?;
        let client: &Client = &client;
        let (bucket, key) = (bucket.as_str(), key.as_str());

        let result = cancellable(
            cancel,
            self.retry_operation(&format!("head_object: {}", key), || async move {
                client
                    .head_object()
                    .bucket(bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| map_sdk_error("HeadObject", e))
            }),
        )
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn test_connection(&self, cancel: &CancellationToken) -> OperationResult {
        info!("Testing S3 connection to bucket: {}", self.default_bucket);

        let result: StorageResult<usize> = async {
            let client = self.pool.acquire(cancel).await?;
            let client: &Client = &client;
            cancellable(cancel, async {
                client
                    .head_bucket()
                    .bucket(&self.default_bucket)
                    .send()
                    .await
                    .map_err(|e| map_sdk_error("HeadBucket", e))?;
                Ok(self.list_keys(client, &self.default_bucket, Some(1)).await?.len())
            })
            .await
        }
        .await;

        match result {
            Ok(found) => OperationResult::ok(format!(
                "Successfully connected to bucket '{}' (found {} object{})",
                self.default_bucket,
                found,
                if found == 1 { "" } else { "s" }
            )),
            Err(e) => OperationResult::failure(format!(
                "Cannot access bucket '{}': {}",
                self.default_bucket, e
            )),
        }
    }
}

#[async_trait]
impl BucketProvider for S3Provider {
    async fn list_buckets(&self, cancel: &CancellationToken) -> StorageResult<Vec<BucketInfo>> {
        let client = self.pool.acquire(cancel).await?;
        let client: &Client = &client;

        let response = cancellable(
            cancel,
            self.retry_operation("list_buckets", || async move {
                client.list_buckets().send().await.map_err(|e| map_sdk_error("ListBuckets", e))
            }),
        )
        .await?;

        let mut buckets: Vec<BucketInfo> = response
            .buckets()
            .iter()
            .filter_map(|bucket| {
                bucket.name().map(|name| BucketInfo {
                    name: name.to_string(),
                    created_at: bucket.creation_date().and_then(to_chrono),
                    size_bytes: None,
                    object_count: None,
                })
            })
            .collect();
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }

    async fn bucket_exists(&self, name: &str, cancel: &CancellationToken) -> StorageResult<bool> {
        validate_bucket_name(name, false)?;
        let client = self.pool.acquire(cancel).await?;
        let client: &Client = &client;

        let result = cancellable(
            cancel,
            self.retry_operation(&format!("head_bucket: {}", name), || async move {
                client
                    .head_bucket()
                    .bucket(name)
                    .send()
                    .await
                    .map_err(|e| map_sdk_error("HeadBucket", e))
            }),
        )
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_bucket(&self, name: &str, cancel: &CancellationToken) -> OperationResult {
        match self.create_bucket_inner(name, cancel).await {
            Ok(()) => {
                info!("Created bucket '{}'", name);
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
        match self.remove_bucket_inner(name, force, cancel).await {
            Ok(()) => {
                info!("Removed bucket '{}' (force: {})", name, force);
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

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(kind: ProviderKind) -> S3Provider {
        S3Provider::new(
            "objects",
            format!("{}:test", kind),
            kind,
            ObjectStorageConfig {
                // Nothing listens here; tests must not reach the network.
                endpoint: Some("http://127.0.0.1:9".to_string()),
                access_key: "access".to_string(),
                secret_key: "secret".to_string(),
                bucket_name: "documents".to_string(),
                region: None,
            },
            2,
            Duration::from_secs(1),
            Arc::new(CapabilityCache::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_bucket_name_rules() {
        assert!(validate_s3_bucket_name("documents-2024").is_ok());
        assert!(validate_s3_bucket_name("my.bucket.name").is_ok());

        assert!(validate_s3_bucket_name("ab").is_err());
        assert!(validate_s3_bucket_name("Uppercase").is_err());
        assert!(validate_s3_bucket_name("double..dot").is_err());
        assert!(validate_s3_bucket_name("192.168.1.10").is_err());
        assert!(validate_s3_bucket_name("-leading").is_err());
        assert!(matches!(
            validate_s3_bucket_name("a/b"),
            Err(StorageError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_default_namespace_maps_to_configured_bucket() {
        let provider = provider(ProviderKind::S3Compatible);
        assert_eq!(
            provider.locate("default/d1/x.pdf").unwrap(),
            ("documents".to_string(), "d1/x.pdf".to_string())
        );
        assert_eq!(
            provider.locate("archive/d1/x.pdf").unwrap(),
            ("archive".to_string(), "d1/x.pdf".to_string())
        );
    }

    #[test]
    fn test_requires_credentials() {
        let result = S3Provider::new(
            "objects",
            "s3:test",
            ProviderKind::S3,
            ObjectStorageConfig {
                endpoint: None,
                access_key: String::new(),
                secret_key: "secret".to_string(),
                bucket_name: "documents".to_string(),
                region: None,
            },
            1,
            Duration::from_secs(1),
            Arc::new(CapabilityCache::new()),
        );
        assert!(matches!(result, Err(StorageError::Validation(_))));
    }

    #[tokio::test]
    async fn test_nested_bucket_is_rejected_before_any_request() {
        let provider = provider(ProviderKind::S3);
        let cancel = CancellationToken::new();

        let result = provider.create_bucket("a/b", &cancel).await;
        assert!(!result.success);
        assert!(result.message.to_lowercase().contains("nested"), "{}", result.message);

        // Validation failures are not permission failures.
        assert_eq!(provider.capabilities.get("s3:test", StorageCapability::BucketCreation), None);
        assert_eq!(provider.pool_stats().idle, 0);
    }

    #[tokio::test]
    async fn test_read_part_stops_at_limit() {
        let mut content = std::io::Cursor::new(vec![1u8; 10]);
        assert_eq!(read_part(&mut content, 4).await.unwrap().len(), 4);
        assert_eq!(read_part(&mut content, 4).await.unwrap().len(), 4);
        assert_eq!(read_part(&mut content, 4).await.unwrap().len(), 2);
        assert!(read_part(&mut content, 4).await.unwrap().is_empty());
    }
}
