use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::storage::error::{StorageError, StorageResult};
use crate::utils::security::mask_secret;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    #[serde(rename = "filesystem")]
    FileSystem,
    #[serde(rename = "ftp")]
    Ftp,
    #[serde(rename = "sftp")]
    Sftp,
    #[serde(rename = "s3")]
    S3,
    #[serde(rename = "s3_compatible")]
    S3Compatible,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::FileSystem,
        ProviderKind::Ftp,
        ProviderKind::Sftp,
        ProviderKind::S3,
        ProviderKind::S3Compatible,
    ];

    pub fn is_object_storage(&self) -> bool {
        matches!(self, ProviderKind::S3 | ProviderKind::S3Compatible)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::FileSystem => write!(f, "filesystem"),
            ProviderKind::Ftp => write!(f, "ftp"),
            ProviderKind::Sftp => write!(f, "sftp"),
            ProviderKind::S3 => write!(f, "s3"),
            ProviderKind::S3Compatible => write!(f, "s3_compatible"),
        }
    }
}

impl TryFrom<String> for ProviderKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "filesystem" => Ok(ProviderKind::FileSystem),
            "ftp" => Ok(ProviderKind::Ftp),
            "sftp" => Ok(ProviderKind::Sftp),
            "s3" => Ok(ProviderKind::S3),
            "s3_compatible" => Ok(ProviderKind::S3Compatible),
            _ => Err(format!("Invalid provider kind: {}", value)),
        }
    }
}

/// One persisted storage provider configuration row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProviderRecord {
    pub id: Uuid,
    pub name: String,
    #[sqlx(try_from = "String")]
    pub kind: ProviderKind,
    pub is_default: bool,
    pub is_active: bool,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemConfig {
    pub root_path: String,
    #[serde(default = "default_true")]
    pub create_directory_if_not_exists: bool,
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FtpConfig {
    pub host: String,
    #[serde(default = "default_ftp_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default = "default_true")]
    pub use_passive_mode: bool,
    #[serde(default = "default_root", alias = "rootPath")]
    pub root_directory: String,
    #[serde(default, alias = "calculateBucketSize")]
    pub calculate_bucket_sizes: bool,
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SftpConfig {
    pub host: String,
    #[serde(default = "default_sftp_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default = "default_root", alias = "rootDirectory")]
    pub root_path: String,
    #[serde(default, alias = "calculateBucketSizes")]
    pub calculate_bucket_size: bool,
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorageConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    pub bucket_name: String,
    #[serde(default)]
    pub region: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_ftp_port() -> u16 {
    21
}

fn default_sftp_port() -> u16 {
    22
}

fn default_root() -> String {
    "/".to_string()
}

impl std::fmt::Debug for FileSystemConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemConfig")
            .field("root_path", &self.root_path)
            .field("create_directory_if_not_exists", &self.create_directory_if_not_exists)
            .finish()
    }
}

impl std::fmt::Debug for FtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &mask_secret(&self.password))
            .field("use_ssl", &self.use_ssl)
            .field("use_passive_mode", &self.use_passive_mode)
            .field("root_directory", &self.root_directory)
            .field("calculate_bucket_sizes", &self.calculate_bucket_sizes)
            .finish()
    }
}

impl std::fmt::Debug for SftpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_deref().map(mask_secret))
            .field("private_key_path", &self.private_key_path)
            .field("passphrase", &self.passphrase.as_deref().map(mask_secret))
            .field("root_path", &self.root_path)
            .field("calculate_bucket_size", &self.calculate_bucket_size)
            .finish()
    }
}

impl std::fmt::Debug for ObjectStorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStorageConfig")
            .field("endpoint", &self.endpoint)
            .field("access_key", &mask_secret(&self.access_key))
            .field("secret_key", &mask_secret(&self.secret_key))
            .field("bucket_name", &self.bucket_name)
            .field("region", &self.region)
            .finish()
    }
}

/// Typed configuration for one provider. The variant is the kind tag.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderConfig {
    FileSystem(FileSystemConfig),
    Ftp(FtpConfig),
    Sftp(SftpConfig),
    /// Shared by [`ProviderKind::S3`] and [`ProviderKind::S3Compatible`].
    ObjectStorage(ObjectStorageConfig),
}

impl ProviderConfig {
    /// Deserialize the persisted JSON for a given backend kind.
    ///
    /// `max_bytes` bounds the serialized size of the record's config.
    pub fn from_json(kind: ProviderKind, value: &serde_json::Value, max_bytes: usize) -> StorageResult<Self> {
        let serialized_len = value.to_string().len();
        if serialized_len > max_bytes {
            return Err(StorageError::Validation(format!(
                "Provider config is {} bytes, exceeding the {} byte limit",
                serialized_len, max_bytes
            )));
        }

        let invalid = |e: serde_json::Error| {
            StorageError::Validation(format!("Invalid {} provider config: {}", kind, e))
        };

        let config = match kind {
            ProviderKind::FileSystem => {
                ProviderConfig::FileSystem(serde_json::from_value(value.clone()).map_err(invalid)?)
            }
            ProviderKind::Ftp => ProviderConfig::Ftp(serde_json::from_value(value.clone()).map_err(invalid)?),
            ProviderKind::Sftp => ProviderConfig::Sftp(serde_json::from_value(value.clone()).map_err(invalid)?),
            ProviderKind::S3 | ProviderKind::S3Compatible => {
                ProviderConfig::ObjectStorage(serde_json::from_value(value.clone()).map_err(invalid)?)
            }
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> StorageResult<()> {
        let missing = |field: &str| StorageError::Validation(format!("{} is required", field));

        match self {
            ProviderConfig::FileSystem(c) => {
                if c.root_path.trim().is_empty() {
                    return Err(missing("rootPath"));
                }
            }
            ProviderConfig::Ftp(c) => {
                if c.host.trim().is_empty() {
                    return Err(missing("host"));
                }
                if c.username.trim().is_empty() {
                    return Err(missing("username"));
                }
            }
            ProviderConfig::Sftp(c) => {
                if c.host.trim().is_empty() {
                    return Err(missing("host"));
                }
                if c.username.trim().is_empty() {
                    return Err(missing("username"));
                }
                if c.password.is_none() && c.private_key_path.is_none() {
                    return Err(StorageError::Validation(
                        "Either password or privateKeyPath is required".to_string(),
                    ));
                }
            }
            ProviderConfig::ObjectStorage(c) => {
                if c.bucket_name.trim().is_empty() {
                    return Err(missing("bucketName"));
                }
                if c.access_key.is_empty() {
                    return Err(missing("accessKey"));
                }
                if c.secret_key.is_empty() {
                    return Err(missing("secretKey"));
                }
            }
        }
        Ok(())
    }

    /// Apply `f` to every sensitive field in place.
    pub fn map_secrets<F>(&mut self, mut f: F) -> StorageResult<()>
    where
        F: FnMut(&str) -> StorageResult<String>,
    {
        match self {
            ProviderConfig::FileSystem(_) => {}
            ProviderConfig::Ftp(c) => {
                c.password = f(&c.password)?;
            }
            ProviderConfig::Sftp(c) => {
                if let Some(password) = c.password.as_deref() {
                    c.password = Some(f(password)?);
                }
                if let Some(passphrase) = c.passphrase.as_deref() {
                    c.passphrase = Some(f(passphrase)?);
                }
            }
            ProviderConfig::ObjectStorage(c) => {
                c.access_key = f(&c.access_key)?;
                c.secret_key = f(&c.secret_key)?;
            }
        }
        Ok(())
    }
}
