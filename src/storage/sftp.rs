//! SFTP storage provider over ssh2
//!
//! Same shape as the FTP adapter: one SSH session per operation on the
//! blocking pool, disconnected when the guard drops.

use async_trait::async_trait;
use ssh2::{ErrorCode, FileStat, Session, Sftp};
use std::io::{self, Cursor, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::capability::{CapabilityCache, StorageCapability};
use super::error::{StorageError, StorageResult};
use super::hashing::hash_and_rewind;
use super::keys::{compose_storage_path, join_remote_path, remote_ancestors, resolve_object_key};
use super::transfer::{checkpoint, pump_content, run_session, spawn_download, upload_channel};
use super::{bucket_failure, cancellable, BucketProvider, ContentReader, ContentSource, StorageProvider, UploadRequest};
use crate::models::{BucketInfo, OperationResult, ProviderKind, SftpConfig, UploadResult};
use crate::utils::security::{normalize_storage_path, validate_bucket_name};

const DIRECTORY_MODE: i32 = 0o755;

fn map_ssh_error(context: &str, err: ssh2::Error) -> StorageError {
    let message = format!("{}: {}", context, err.message());
    match err.code() {
        // NO_SUCH_FILE, NO_SUCH_PATH
        ErrorCode::SFTP(2) | ErrorCode::SFTP(10) => StorageError::NotFound(message),
        // PERMISSION_DENIED, WRITE_PROTECT
        ErrorCode::SFTP(3) | ErrorCode::SFTP(12) => StorageError::PermissionDenied(message),
        // FILE_ALREADY_EXISTS
        ErrorCode::SFTP(11) => StorageError::Validation(message),
        ErrorCode::SFTP(_) => StorageError::Internal(message),
        // AUTHENTICATION_FAILED, PUBLICKEY_UNVERIFIED
        ErrorCode::Session(-18) | ErrorCode::Session(-19) => StorageError::PermissionDenied(message),
        ErrorCode::Session(_) => StorageError::ConnectionFailure(message),
    }
}

fn io_context(context: &str, err: io::Error) -> StorageError {
    match StorageError::from(err) {
        StorageError::NotFound(m) => StorageError::NotFound(format!("{}: {}", context, m)),
        StorageError::PermissionDenied(m) => StorageError::PermissionDenied(format!("{}: {}", context, m)),
        StorageError::ConnectionFailure(m) => StorageError::ConnectionFailure(format!("{}: {}", context, m)),
        StorageError::Internal(m) => StorageError::Internal(format!("{}: {}", context, m)),
        other => other,
    }
}

fn entry_name(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| name != "." && name != "..")
}

/// Authenticated SFTP channel; disconnects the session when dropped.
struct SftpSession {
    sftp: Sftp,
    session: Session,
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        if let Err(e) = self.session.disconnect(None, "closing", None) {
            debug!("SSH disconnect failed: {}", e);
        }
    }
}

#[derive(Clone)]
struct SftpConnector {
    config: Arc<SftpConfig>,
    timeout: Duration,
}

impl SftpConnector {
    fn open(&self) -> StorageResult<SftpSession> {
        let address = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| StorageError::ConnectionFailure(format!("Cannot resolve {}: {}", self.config.host, e)))?
            .next()
            .ok_or_else(|| StorageError::ConnectionFailure(format!("No address for {}", self.config.host)))?;

        let tcp = TcpStream::connect_timeout(&address, self.timeout)
            .map_err(|e| io_context(&format!("connect {}", address), e))?;

        let mut session = Session::new().map_err(|e| map_ssh_error("session", e))?;
        session.set_timeout(self.timeout.as_millis().min(u32::MAX as u128) as u32);
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| map_ssh_error("handshake", e))?;

        match (&self.config.private_key_path, &self.config.password) {
            (Some(key_path), _) => session
                .userauth_pubkey_file(
                    &self.config.username,
                    None,
                    Path::new(key_path),
                    self.config.passphrase.as_deref(),
                )
                .map_err(|e| map_ssh_error("public key authentication", e))?,
            (None, Some(password)) => session
                .userauth_password(&self.config.username, password)
                .map_err(|e| map_ssh_error("password authentication", e))?,
            (None, None) => {
                return Err(StorageError::Validation(
                    "Either password or privateKeyPath is required".to_string(),
                ))
            }
        }

        if !session.authenticated() {
            return Err(StorageError::PermissionDenied(format!(
                "Authentication as {} was rejected",
                self.config.username
            )));
        }

        let sftp = session.sftp().map_err(|e| map_ssh_error("sftp subsystem", e))?;
        Ok(SftpSession { sftp, session })
    }
}

impl SftpSession {
    fn stat(&self, path: &str) -> StorageResult<Option<FileStat>> {
        match self.sftp.stat(Path::new(path)) {
            Ok(stat) => Ok(Some(stat)),
            Err(e) => match map_ssh_error(&format!("stat {}", path), e) {
                StorageError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    fn is_directory(&self, path: &str) -> StorageResult<bool> {
        Ok(self.stat(path)?.map(|stat| stat.is_dir()).unwrap_or(false))
    }

    fn ensure_parents(&self, path: &str) -> StorageResult<()> {
        for dir in remote_ancestors(path) {
            if self.is_directory(&dir)? {
                continue;
            }
            self.sftp
                .mkdir(Path::new(&dir), DIRECTORY_MODE)
                .map_err(|e| map_ssh_error(&format!("mkdir {}", dir), e))?;
        }
        Ok(())
    }

    fn put(&self, path: &str, reader: &mut impl Read, token: &CancellationToken) -> StorageResult<u64> {
        self.ensure_parents(path)?;
        checkpoint(token)?;
        let mut file = self
            .sftp
            .create(Path::new(path))
            .map_err(|e| map_ssh_error(&format!("create {}", path), e))?;

        match io::copy(reader, &mut file) {
            Ok(written) => Ok(written),
            Err(e) => {
                drop(file);
                if let Err(cleanup) = self.sftp.unlink(Path::new(path)) {
                    debug!("Could not remove partial upload {}: {}", path, cleanup);
                }
                Err(io_context(&format!("write {}", path), e))
            }
        }
    }

    fn entries(&self, path: &str) -> StorageResult<Vec<(PathBuf, FileStat)>> {
        let entries = self
            .sftp
            .readdir(Path::new(path))
            .map_err(|e| map_ssh_error(&format!("readdir {}", path), e))?;
        Ok(entries
            .into_iter()
            .filter(|(entry, _)| entry_name(entry).is_some())
            .collect())
    }

    fn usage(&self, path: &str) -> StorageResult<(u64, u64)> {
        let mut size = 0u64;
        let mut count = 0u64;
        for (entry, stat) in self.entries(path)? {
            if stat.is_dir() {
                let (child_size, child_count) = self.usage(&entry.to_string_lossy())?;
                size += child_size;
                count += child_count;
            } else {
                size += stat.size.unwrap_or(0);
                count += 1;
            }
        }
        Ok((size, count))
    }

    fn remove_tree(&self, path: &str, token: &CancellationToken) -> StorageResult<()> {
        for (entry, stat) in self.entries(path)? {
            if token.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            if stat.is_dir() {
                self.remove_tree(&entry.to_string_lossy(), token)?;
            } else {
                self.sftp
                    .unlink(&entry)
                    .map_err(|e| map_ssh_error(&format!("unlink {}", entry.display()), e))?;
            }
        }
        self.sftp
            .rmdir(Path::new(path))
            .map_err(|e| map_ssh_error(&format!("rmdir {}", path), e))
    }
}

/// Provider storing documents on an SSH server through SFTP.
pub struct SftpProvider {
    name: String,
    instance_key: String,
    root: String,
    calculate_sizes: bool,
    connector: SftpConnector,
    capabilities: Arc<CapabilityCache>,
}

impl SftpProvider {
    pub fn new(
        name: impl Into<String>,
        instance_key: impl Into<String>,
        config: SftpConfig,
        timeout: Duration,
        capabilities: Arc<CapabilityCache>,
    ) -> Self {
        let root = if config.root_path.trim().is_empty() {
            "/".to_string()
        } else {
            config.root_path.clone()
        };
        let calculate_sizes = config.calculate_bucket_size;

        Self {
            name: name.into(),
            instance_key: instance_key.into(),
            root,
            calculate_sizes,
            connector: SftpConnector {
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

    fn endpoint(&self) -> String {
        format!("{}:{}", self.connector.config.host, self.connector.config.port)
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
            run_session(cancel, move |token| connector.open()?.put(&target, &mut reader, &token)),
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

        info!("Stored document on SFTP server: {}", remote);
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
impl StorageProvider for SftpProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Sftp
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
        debug!("SFTP provider '{}' ready ({}, root {})", self.name, self.endpoint(), self.root);
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
                    "SFTP upload of {} failed: {}",
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

        run_session(cancel, move |token| connector.open()?.put(&remote, &mut Cursor::new(data), &token)).await?;
        Ok(normalized)
    }

    async fn download(&self, storage_path: &str, cancel: &CancellationToken) -> StorageResult<ContentReader> {
        let remote = self.remote_path(storage_path)?;
        let connector = self.connector.clone();
        let token = cancel.clone();

        spawn_download(cancel, move |mut sink| {
            let session = match connector.open() {
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

            let mut file = match session.sftp.open(Path::new(&remote)) {
                Ok(file) => file,
                Err(e) => {
                    sink.opened(Err(map_ssh_error(&format!("open {}", remote), e)));
                    return;
                }
            };
            sink.opened(Ok(()));

            match sink.copy_from(&mut file, &token) {
                Ok(copied) => debug!("Streamed {} bytes from {}", copied, remote),
                Err(e) => debug!("Download of {} stopped: {}", remote, e),
            }
        })
        .await
    }

    async fn delete(&self, storage_path: &str, cancel: &CancellationToken) -> StorageResult<()> {
        let remote = self.remote_path(storage_path)?;
        let connector = self.connector.clone();
        let target = remote.clone();

        let result = run_session(cancel, move |token| {
            let session = connector.open()?;
            checkpoint(&token)?;
            session
                .sftp
                .unlink(Path::new(&target))
                .map_err(|e| map_ssh_error(&format!("unlink {}", target), e))
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
            let session = connector.open()?;
            checkpoint(&token)?;
            Ok(session.stat(&remote)?.map(|stat| stat.is_file()).unwrap_or(false))
        })
        .await
    }

    async fn test_connection(&self, cancel: &CancellationToken) -> OperationResult {
        let connector = self.connector.clone();
        let root = self.root.clone();

        let result = run_session(cancel, move |token| {
            let session = connector.open()?;
            checkpoint(&token)?;
            if !session.is_directory(&root)? {
                return Err(StorageError::NotFound(format!("Root path {} does not exist", root)));
            }
            Ok(())
        })
        .await;

        match result {
            Ok(()) => OperationResult::ok(format!("Connected to {} and found root path {}", self.endpoint(), self.root)),
            Err(e) => OperationResult::failure(format!("SFTP connection to {} failed: {}", self.endpoint(), e)),
        }
    }
}

#[async_trait]
impl BucketProvider for SftpProvider {
    async fn list_buckets(&self, cancel: &CancellationToken) -> StorageResult<Vec<BucketInfo>> {
        let connector = self.connector.clone();
        let root = self.root.clone();
        let calculate_sizes = self.calculate_sizes;

        let mut buckets = run_session(cancel, move |token| {
            let session = connector.open()?;
            checkpoint(&token)?;
            let mut buckets = Vec::new();
            for (entry, stat) in session.entries(&root)? {
                if !stat.is_dir() {
                    continue;
                }
                if token.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
                let Some(name) = entry_name(&entry) else {
                    continue;
                };

                let mut info = BucketInfo::named(name);
                info.created_at = stat
                    .mtime
                    .and_then(|secs| chrono::DateTime::from_timestamp(secs as i64, 0));
                if calculate_sizes {
                    let (size, count) = session.usage(&entry.to_string_lossy())?;
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
            let session = connector.open()?;
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
                let session = connector.open()?;
                if session.stat(&path)?.is_some() {
                    return Err(StorageError::Validation(format!("Bucket '{}' already exists", bucket)));
                }
                checkpoint(&token)?;
                session.ensure_parents(&path)?;
                session
                    .sftp
                    .mkdir(Path::new(&path), DIRECTORY_MODE)
                    .map_err(|e| map_ssh_error(&format!("mkdir {}", path), e))
            })
            .await
        }
        .await;

        match result {
            Ok(()) => {
                info!("Created bucket directory '{}' on {}", name, self.endpoint());
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
                let session = connector.open()?;
                if !session.is_directory(&path)? {
                    return Err(StorageError::NotFound(format!("Bucket '{}' does not exist", bucket)));
                }
                if !force && !session.entries(&path)?.is_empty() {
                    return Err(StorageError::Validation(format!(
                        "Bucket '{}' is not empty; use force to delete its contents",
                        bucket
                    )));
                }
                checkpoint(&token)?;
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
