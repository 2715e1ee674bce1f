// Re-export all model types for ease of use

pub mod provider;
pub mod storage;

pub use provider::{
    FileSystemConfig, FtpConfig, ObjectStorageConfig, ProviderConfig, ProviderKind, ProviderRecord,
    SftpConfig,
};
pub use storage::*;
