//! Factory for creating storage providers from their kind tag and configuration

use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::capability::CapabilityCache;
use super::error::{StorageError, StorageResult};
use super::local::FileSystemProvider;
use super::manager::StorageSettings;
use super::StorageProvider;
use crate::models::{ProviderConfig, ProviderKind};

#[cfg(feature = "ftp")]
use super::ftp::FtpProvider;
#[cfg(feature = "s3")]
use super::s3::S3Provider;
#[cfg(feature = "sftp")]
use super::sftp::SftpProvider;

/// Everything a constructor needs besides the backend configuration.
pub struct ProviderContext<'a> {
    pub id: Uuid,
    pub name: &'a str,
    pub kind: ProviderKind,
    pub capabilities: Arc<CapabilityCache>,
    pub settings: &'a StorageSettings,
}

type Constructor = fn(&ProviderContext<'_>, ProviderConfig, String) -> StorageResult<Arc<dyn StorageProvider>>;

/// Identity of one provider instance: `{kind}:{id}:{nonce}`.
///
/// The nonce is drawn once here, so every rebuild of a record gets a fresh
/// key while the key of a live instance never changes.
pub fn new_instance_key(kind: ProviderKind, id: Uuid) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{}:{}:{}", kind, id, &nonce[..12])
}

fn constructor_for(kind: ProviderKind) -> Option<Constructor> {
    match kind {
        ProviderKind::FileSystem => Some(build_filesystem as Constructor),
        #[cfg(feature = "ftp")]
        ProviderKind::Ftp => Some(build_ftp as Constructor),
        #[cfg(feature = "sftp")]
        ProviderKind::Sftp => Some(build_sftp as Constructor),
        #[cfg(feature = "s3")]
        ProviderKind::S3 | ProviderKind::S3Compatible => Some(build_object_storage as Constructor),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

/// Build a provider for `config`, which must already carry plaintext secrets.
pub fn create_provider(context: &ProviderContext<'_>, config: ProviderConfig) -> StorageResult<Arc<dyn StorageProvider>> {
    let constructor = constructor_for(context.kind).ok_or_else(|| {
        StorageError::UnsupportedOperation(format!(
            "Storage kind '{}' is not compiled into this build",
            context.kind
        ))
    })?;

    let instance_key = new_instance_key(context.kind, context.id);
    debug!("Creating {} provider '{}' as {}", context.kind, context.name, instance_key);
    constructor(context, config, instance_key)
}

fn mismatch(context: &ProviderContext<'_>) -> StorageError {
    StorageError::Validation(format!(
        "Configuration of provider '{}' does not match kind '{}'",
        context.name, context.kind
    ))
}

fn build_filesystem(
    context: &ProviderContext<'_>,
    config: ProviderConfig,
    instance_key: String,
) -> StorageResult<Arc<dyn StorageProvider>> {
    match config {
        ProviderConfig::FileSystem(config) => Ok(Arc::new(FileSystemProvider::new(
            context.name,
            instance_key,
            config,
            context.capabilities.clone(),
        ))),
        _ => Err(mismatch(context)),
    }
}

#[cfg(feature = "ftp")]
fn build_ftp(
    context: &ProviderContext<'_>,
    config: ProviderConfig,
    instance_key: String,
) -> StorageResult<Arc<dyn StorageProvider>> {
    match config {
        ProviderConfig::Ftp(config) => Ok(Arc::new(FtpProvider::new(
            context.name,
            instance_key,
            config,
            context.settings.remote_timeout,
            context.capabilities.clone(),
        ))),
        _ => Err(mismatch(context)),
    }
}

#[cfg(feature = "sftp")]
fn build_sftp(
    context: &ProviderContext<'_>,
    config: ProviderConfig,
    instance_key: String,
) -> StorageResult<Arc<dyn StorageProvider>> {
    match config {
        ProviderConfig::Sftp(config) => Ok(Arc::new(SftpProvider::new(
            context.name,
            instance_key,
            config,
            context.settings.remote_timeout,
            context.capabilities.clone(),
        ))),
        _ => Err(mismatch(context)),
    }
}

#[cfg(feature = "s3")]
fn build_object_storage(
    context: &ProviderContext<'_>,
    config: ProviderConfig,
    instance_key: String,
) -> StorageResult<Arc<dyn StorageProvider>> {
    match config {
        ProviderConfig::ObjectStorage(config) => Ok(Arc::new(S3Provider::new(
            context.name,
            instance_key,
            context.kind,
            config,
            context.settings.pool_size,
            context.settings.remote_timeout,
            context.capabilities.clone(),
        )?)),
        _ => Err(mismatch(context)),
    }
}
