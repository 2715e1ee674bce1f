//! FTP / FTPS storage provider
//!
//! Every operation opens its own control connection on the blocking pool
//! and closes it when the session guard drops, on success, error or
//! cancellation alike.

use async_trait::async_trait;
use std::io::Cursor;
use std::net::ToSocketAddrs;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use suppaftp::list::File as ListEntry;
use suppaftp::native_tls::TlsConnector;
use suppaftp::types::FileType;
use suppaftp::{FtpError, Mode, NativeTlsConnector, NativeTlsFtpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::capability::{CapabilityCache, StorageCapability};
use super::error::{classify_error_message, StorageError, StorageResult};
use super::hashing::hash_and_rewind;
use super::keys::{compose_storage_path, join_remote_path, remote_ancestors, resolve_object_key};
use super::transfer::{checkpoint, pump_content, run_session, spawn_download, upload_channel};
use super::{bucket_failure, cancellable, BucketProvider, ContentReader, ContentSource, StorageProvider, UploadRequest};
use crate::models::{BucketInfo, FtpConfig, OperationResult, ProviderKind, UploadResult};
use crate::utils::security::{normalize_storage_path, validate_bucket_name};

fn map_ftp_error(context: &str, err: FtpError) -> StorageError {
    match err {
        FtpError::ConnectionError(e) => {
            let message = format!("{}: {}", context, e);
            match StorageError::from(e) {
                StorageError::Internal(_) => StorageError::ConnectionFailure(message),
                other => other,
            }
        }
        FtpError::SecureError(e) => StorageError::ConnectionFailure(format!("{}: TLS error: {}", context, e)),
        FtpError::UnexpectedResponse(response) => {
            let code = response.status.code();
            let text = String::from_utf8_lossy(&response.body).trim().to_string();
            let message = format!("{}: {} {}", context, code, text);
            let lower = text.to_lowercase();

            match code {
                530 | 532 => StorageError::PermissionDenied(message),
                550 if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed") => {
                    StorageError::PermissionDenied(message)
                }
                550 | 450 => match classify_error_message(&message) {
                    StorageError::Internal(_) | StorageError::Validation(_) => StorageError::NotFound(message),
                    other => other,
                },
                421 | 425 | 426 => StorageError::ConnectionFailure(message),
                553 => StorageError::Validation(message),
                _ => classify_error_message(&message),
            }
        }
        other => StorageError::Internal(format!("{}: {}", context, other)),
    }
}

/// Open control connection; sends QUIT when dropped.
struct FtpSession {
    stream: NativeTlsFtpStream,
}

impl Drop for FtpSession {
    fn drop(&mut self) {
        if let Err(e) = self.stream.quit() {
            debug!("FTP QUIT failed: {}", e);
        }
    }
}

#[derive(Clone)]
struct FtpConnector {
    config: Arc<FtpConfig>,
    timeout: Duration,
}

impl FtpConnector {
    fn open(&self) -> StorageResult<FtpSession> {
        let address = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| StorageError::ConnectionFailure(format!("Cannot resolve {}: {}", self.config.host, e)))?
            .next()
            .ok_or_else(|| StorageError::ConnectionFailure(format!("No address for {}", self.config.host)))?;

        let mut stream = NativeTlsFtpStream::connect_timeout(address, self.timeout)
            .map_err(|e| map_ftp_error("connect", e))?;
        stream
            .get_ref()
            .set_read_timeout(Some(self.timeout))
            .map_err(StorageError::from)?;

        if self.config.use_ssl {
            let connector = TlsConnector::new()
                .map_err(|e| StorageError::ConnectionFailure(format!("TLS setup failed: {}", e)))?;
            stream = stream
                .into_secure(NativeTlsConnector::from(connector), &self.config.host)
                .map_err(|e| map_ftp_error("secure", e))?;
        }

        let mut session = FtpSession { stream };
        session
            .stream
            .login(&self.config.username, &self.config.password)
            .map_err(|e| map_ftp_error("login", e))?;
        session.stream.set_mode(if self.config.use_passive_mode {
            Mode::Passive
        } else {
            Mode::Active
        });
        session
            .stream
            .transfer_type(FileType::Binary)
            .map_err(|e| map_ftp_error("TYPE I", e))?;
        Ok(session)
    }
}

impl FtpSession {
    /// Create every missing ancestor of `path`. Existing directories make
    /// MKD fail, which is expected and ignored; real problems surface on
    /// the transfer that follows.
    fn ensure_parents(&mut self, path: &str) {
        for dir in remote_ancestors(path) {
            if let Err(e) = self.stream.mkdir(&dir) {
                debug!("MKD {} skipped: {}", dir, e);
            }
        }
    }

    fn put(&mut self, path: &str, reader: &mut impl std::io::Read, token: &CancellationToken) -> StorageResult<u64> {
        self.ensure_parents(path);
        checkpoint(token)?;
        match self.stream.put_file(path, reader) {
            Ok(written) => Ok(written),
            Err(e) => {
                let err = map_ftp_error(&format!("STOR {}", path), e);
                if let Err(cleanup) = self.stream.rm(path) {
                    debug!("Could not remove partial upload {}: {}", path, cleanup);
                }
                Err(err)
            }
        }
    }

    /// Check with CWD, then return to the previous working directory so
    /// relative paths keep resolving against the login directory.
    fn is_directory(&mut self, path: &str) -> StorageResult<bool> {
        let original = self.stream.pwd().map_err(|e| map_ftp_error("PWD", e))?;
        match self.stream.cwd(path) {
            Ok(()) => {
                self.stream
                    .cwd(&original)
                    .map_err(|e| map_ftp_error(&format!("CWD {}", original), e))?;
                Ok(true)
            }
            Err(e) => match map_ftp_error(&format!("CWD {}", path), e) {
                StorageError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    fn entries(&mut self, path: &str) -> StorageResult<Vec<ListEntry>> {
        let lines = self
            .stream
            .list(Some(path))
            .map_err(|e| map_ftp_error(&format!("LIST {}", path), e))?;

        Ok(lines
            .iter()
            .filter_map(|line| match ListEntry::from_str(line) {
                Ok(entry) => Some(entry),
                Err(_) => {
                    debug!("Skipping unparseable LIST line: {}", line);
                    None
                }
            })
            .filter(|entry| entry.name() != "." && entry.name() != "..")
            .collect())
    }

    /// Total size and file count below `path`.
    fn usage(&mut self, path: &str) -> StorageResult<(u64, u64)> {
        let mut size = 0u64;
        let mut count = 0u64;
        for entry in self.entries(path)? {
            let child = join_remote_path(path, entry.name());
            if entry.is_directory() {
                let (child_size, child_count) = self.usage(&child)?;
                size += child_size;
                count += child_count;
            } else {
                size += entry.size() as u64;
                count += 1;
            }
        }
        Ok((size, count))
    }

    fn remove_tree(&mut self, path: &str, token: &CancellationToken) -> StorageResult<()> {
        for entry in self.entries(path)? {
            if token.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            let child = join_remote_path(path, entry.name());
            if entry.is_directory() {
                self.remove_tree(&child, token)?;
            } else {
                self.stream
                    .rm(&child)
                    .map_err(|e| map_ftp_error(&format!("DELE {}", child), e))?;
            }
        }
        self.stream
            .rmdir(path)
            .map_err(|e| map_ftp_error(&format!("RMD {}", path), e))
    }
}

/// Provider storing documents on an FTP or FTPS server.
pub struct FtpProvider {
    name: String,
    instance_key: String,
    root: String,
    calculate_sizes: bool,
    connector: FtpConnector,
    capabilities: Arc<CapabilityCache>,
}

impl FtpProvider {
    pub fn new(
        name: impl Into<String>,
        instance_key: impl Into<String>,
        config: FtpConfig,
        timeout: Duration,
        capabilities: Arc<CapabilityCache>,
    ) -> Self {
        let root = if config.root_directory.trim().is_empty() {
            "/".to_string()
        } else {
            config.root_directory.clone()
        };
        let calculate_sizes = config.calculate_bucket_sizes;

        Self {
            name: name.into(),
            instance_key: instance_key.into(),
            root,
            calculate_sizes,
            connector: FtpConnector {
                config: Arc::new(config),
                timeout,
            },
            capabilities,
        }
    }

    fn remote_path(&self, storage_path: &str) -> StorageResult<String> {
        Ok(join_remote_path(&self.root, &normalize_storage_path(storage_path)?))
    }

    fn bucket_path(&self, name: &str) -> StorageResult<String> {
        validate_bucket_name(name, true)?;
        Ok(join_remote_path(&self.root, name.trim_matches('/')))
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
        let remote = self.remote_path(&storage_path)?;

        let (sender, mut reader) = upload_channel();
        let connector = self.connector.clone();
        let target = remote.clone();

        let (stored, pumped) = tokio::join!(
            run_session(cancel, move |token| {
                let mut session = connector.open()?;
                session.put(&target, &mut reader, &token)
            }),
            pump_content(content, sender, cancel),
        );
        let written = stored?;
        pumped?;

        if written != size {
            warn!(
                "Upload of {} wrote {} bytes but hashed {}; content changed during transfer",
                storage_path, written, size
            );
        }

        info!("Stored document on FTP server: {}", remote);
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
}

#[async_trait]
impl StorageProvider for FtpProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ftp
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
        debug!(
            "FTP provider '{}' ready ({}:{}, root {})",
            self.name, self.connector.config.host, self.connector.config.port, self.root
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
                    "FTP upload of {} failed: {}",
                    request.file_name,
                    e
                );
                UploadResult::failed(request.file_name.clone(), self.name.clone(), e.to_string())
            }
        }
    }

    async fn upload_bytes(&self, storage_path: &str, data: &[u8], cancel: &CancellationToken) -> StorageResult<String> {
        let normalized = normalize_storage_path(storage_path)?;
        let remote = self.remote_path(&normalized)?;
        let connector = self.connector.clone();
        let data = data.to_vec();

        run_session(cancel, move |token| {
            let mut session = connector.open()?;
            session.put(&remote, &mut Cursor::new(data), &token)
        })
        .await?;
        Ok(normalized)
    }

    async fn download(&self, storage_path: &str, cancel: &CancellationToken) -> StorageResult<ContentReader> {
        let remote = self.remote_path(storage_path)?;
        let connector = self.connector.clone();
        let token = cancel.clone();

        spawn_download(cancel, move |mut sink| {
            let mut session = match connector.open() {
                Ok(session) => session,
                Err(e) => {
                    sink.opened(Err(e));
                    return;
                }
            };

            if let Err(e) = checkpoint(&token) {
                sink.opened(Err(e));
                return;
            }

            let mut data = match session.stream.retr_as_stream(&remote) {
                Ok(data) => data,
                Err(e) => {
                    sink.opened(Err(map_ftp_error(&format!("RETR {}", remote), e)));
                    return;
                }
            };
            sink.opened(Ok(()));

            match sink.copy_from(&mut data, &token) {
                Ok(copied) => {
                    if let Err(e) = session.stream.finalize_retr_stream(data) {
                        warn!("RETR {} did not complete cleanly: {}", remote, e);
                    } else {
                        debug!("Streamed {} bytes from {}", copied, remote);
                    }
                }
                Err(e) => {
                    debug!("Download of {} stopped: {}", remote, e);
                    drop(data);
                }
            }
        })
        .await
    }

    async fn delete(&self, storage_path: &str, cancel: &CancellationToken) -> StorageResult<()> {
        let remote = self.remote_path(storage_path)?;
        let connector = self.connector.clone();
        let target = remote.clone();

        let result = run_session(cancel, move |token| {
            let mut session = connector.open()?;
            checkpoint(&token)?;
            session
                .stream
                .rm(&target)
                .map_err(|e| map_ftp_error(&format!("DELE {}", target), e))
        })
        .await;

        match result {
            Ok(()) => {
                info!("Deleted file: {}", remote);
                Ok(())
            }
            Err(StorageError::NotFound(_)) => {
                info!("File already deleted: {}", remote);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn check_exists(&self, storage_path: &str, cancel: &CancellationToken) -> StorageResult<bool> {
        let remote = self.remote_path(storage_path)?;
        let connector = self.connector.clone();

        run_session(cancel, move |token| {
            let mut session = connector.open()?;
            checkpoint(&token)?;
            match session.stream.size(&remote) {
                Ok(_) => Ok(true),
                Err(e) => match map_ftp_error(&format!("SIZE {}", remote), e) {
                    StorageError::NotFound(_) => Ok(false),
                    other => Err(other),
                },
            }
        })
        .await
    }

    async fn test_connection(&self, cancel: &CancellationToken) -> OperationResult {
        let connector = self.connector.clone();
        let root = self.root.clone();

        let result = run_session(cancel, move |token| {
            let mut session = connector.open()?;
            checkpoint(&token)?;
            if !session.is_directory(&root)? {
                return Err(StorageError::NotFound(format!("Root directory {} does not exist", root)));
            }
            Ok(())
        })
        .await;

        match result {
            Ok(()) => OperationResult::ok(format!(
                "Connected to {}:{} and found root directory {}",
                self.connector.config.host, self.connector.config.port, self.root
            )),
            Err(e) => OperationResult::failure(format!(
                "FTP connection to {}:{} failed: {}",
                self.connector.config.host, self.connector.config.port, e
            )),
        }
    }
}

#[async_trait]
impl BucketProvider for FtpProvider {
    async fn list_buckets(&self, cancel: &CancellationToken) -> StorageResult<Vec<BucketInfo>> {
        let connector = self.connector.clone();
        let root = self.root.clone();
        let calculate_sizes = self.calculate_sizes;

        let mut buckets = run_session(cancel, move |token| {
            let mut session = connector.open()?;
            checkpoint(&token)?;
            let mut buckets = Vec::new();
            for entry in session.entries(&root)? {
                if !entry.is_directory() {
                    continue;
                }
                if token.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }

                let mut info = BucketInfo::named(entry.name());
                info.created_at = Some(chrono::DateTime::<chrono::Utc>::from(entry.modified()));
                if calculate_sizes {
                    let (size, count) = session.usage(&join_remote_path(&root, entry.name()))?;
                    info.size_bytes = Some(size);
                    info.object_count = Some(count);
                }
                buckets.push(info);
            }
            Ok(buckets)
        })
        .await?;

        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }

    async fn bucket_exists(&self, name: &str, cancel: &CancellationToken) -> StorageResult<bool> {
        let path = self.bucket_path(name)?;
        let connector = self.connector.clone();

        run_session(cancel, move |token| {
            let mut session = connector.open()?;
            checkpoint(&token)?;
            session.is_directory(&path)
        })
        .await
    }

    async fn create_bucket(&self, name: &str, cancel: &CancellationToken) -> OperationResult {
        let result: StorageResult<()> = async {
            let path = self.bucket_path(name)?;
            let connector = self.connector.clone();
            let bucket = name.to_string();

            run_session(cancel, move |token| {
                let mut session = connector.open()?;
                if session.is_directory(&path)? {
                    return Err(StorageError::Validation(format!("Bucket '{}' already exists", bucket)));
                }
                checkpoint(&token)?;
                session.ensure_parents(&path);
                session
                    .stream
                    .mkdir(&path)
                    .map_err(|e| map_ftp_error(&format!("MKD {}", path), e))
            })
            .await
        }
        .await;

        match result {
            Ok(()) => {
                info!("Created bucket directory '{}' on {}", name, self.connector.config.host);
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
        let result: StorageResult<()> = async {
            let path = self.bucket_path(name)?;
            let connector = self.connector.clone();
            let bucket = name.to_string();

            run_session(cancel, move |token| {
                let mut session = connector.open()?;
                if !session.is_directory(&path)? {
                    return Err(StorageError::NotFound(format!("Bucket '{}' does not exist", bucket)));
                }

                let entries = session.entries(&path)?;
                checkpoint(&token)?;
                if entries.is_empty() {
                    return session
                        .stream
                        .rmdir(&path)
                        .map_err(|e| map_ftp_error(&format!("RMD {}", path), e));
                }
                if !force {
                    return Err(StorageError::Validation(format!(
                        "Bucket '{}' is not empty; use force to delete its contents",
                        bucket
                    )));
                }
                session.remove_tree(&path, &token)
            })
            .await
        }
        .await;

        match result {
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

#[cfg(test)]
mod tests {
    use super::*;
    use suppaftp::types::Response;
    use suppaftp::Status;

    fn response(status: Status, body: &str) -> FtpError {
        FtpError::UnexpectedResponse(Response::new(status, body.as_bytes().to_vec()))
    }

    fn provider(root: &str) -> FtpProvider {
        FtpProvider::new(
            "ftp",
            "ftp:test",
            FtpConfig {
                host: "127.0.0.1".to_string(),
                port: 9,
                username: "user".to_string(),
                password: "secret".to_string(),
                use_ssl: false,
                use_passive_mode: true,
                root_directory: root.to_string(),
                calculate_bucket_sizes: false,
            },
            Duration::from_secs(1),
            Arc::new(CapabilityCache::new()),
        )
    }

    #[test]
    fn test_reply_classification() {
        assert!(matches!(
            map_ftp_error("login", response(Status::NotLoggedIn, "530 Login incorrect.")),
            StorageError::PermissionDenied(_)
        ));
        assert!(matches!(
            map_ftp_error("MKD x", response(Status::FileUnavailable, "550 Permission denied.")),
            StorageError::PermissionDenied(_)
        ));
        assert!(matches!(
            map_ftp_error("RETR x", response(Status::FileUnavailable, "550 No such file or directory.")),
            StorageError::NotFound(_)
        ));
        assert!(matches!(
            map_ftp_error("RETR x", response(Status::FileUnavailable, "550 Failed to open file.")),
            StorageError::NotFound(_)
        ));
    }

    #[test]
    fn test_remote_paths_stay_under_root() {
        let provider = provider("/srv/docs/");
        assert_eq!(provider.remote_path("default/d1/a.pdf").unwrap(), "/srv/docs/default/d1/a.pdf");
        assert!(provider.remote_path("../etc/passwd").is_err());
        assert_eq!(provider.bucket_path("2024/q1").unwrap(), "/srv/docs/2024/q1");
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_failure() {
        let provider = provider("/");
        let cancel = CancellationToken::new();

        let result = provider.test_connection(&cancel).await;
        assert!(!result.success);
        assert!(!provider.exists("default/a.txt", &cancel).await);
        assert!(provider.check_exists("default/a.txt", &cancel).await.is_err());
    }
}
