//! Error taxonomy shared by every storage provider

use thiserror::Error;
use uuid::Uuid;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// The provider id resolves to a record that is inactive or has been deleted.
    #[error("Storage provider {0} is not active")]
    NotActive(Uuid),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, StorageError::PermissionDenied(_))
    }

    /// Transient faults are the only ones worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::ConnectionFailure(_))
    }

    pub fn internal(message: impl std::fmt::Display) -> Self {
        StorageError::Internal(message.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::NotFound => StorageError::NotFound(err.to_string()),
            ErrorKind::PermissionDenied => StorageError::PermissionDenied(err.to_string()),
            ErrorKind::InvalidInput | ErrorKind::InvalidData => StorageError::Validation(err.to_string()),
            ErrorKind::Interrupted => StorageError::Cancelled,
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::AddrNotAvailable => StorageError::ConnectionFailure(err.to_string()),
            _ => StorageError::Internal(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            StorageError::Cancelled
        } else {
            StorageError::Internal(format!("Background storage task failed: {}", err))
        }
    }
}

/// Classify a protocol error message that carries no structured code.
///
/// Remote servers (FTP replies, S3-compatible gateways) mostly report failures
/// as text, so this matches the common phrasings for each category.
pub fn classify_error_message(message: &str) -> StorageError {
    let lower = message.to_lowercase();

    if lower.contains("accessdenied")
        || lower.contains("access denied")
        || lower.contains("permission denied")
        || lower.contains("not authorized")
        || lower.contains("forbidden")
        || lower.contains("signaturedoesnotmatch")
        || lower.contains("invalidaccesskeyid")
        || lower.contains("not logged in")
    {
        StorageError::PermissionDenied(message.to_string())
    } else if lower.contains("nosuchkey")
        || lower.contains("nosuchbucket")
        || lower.contains("no such file")
        || lower.contains("not found")
        || lower.contains("does not exist")
    {
        StorageError::NotFound(message.to_string())
    } else if lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("network")
        || lower.contains("dispatch failure")
        || lower.contains("serviceunavailable")
        || lower.contains("slowdown")
    {
        StorageError::ConnectionFailure(message.to_string())
    } else if lower.contains("invalidbucketname") || lower.contains("invalid") {
        StorageError::Validation(message.to_string())
    } else if lower.contains("unsupported") || lower.contains("not implemented") {
        StorageError::UnsupportedOperation(message.to_string())
    } else {
        StorageError::Internal(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let err: StorageError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(err.is_not_found());

        let err: StorageError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope").into();
        assert!(err.is_permission_denied());

        let err: StorageError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert!(err.is_transient());
    }

    #[test]
    fn test_classify_error_message() {
        assert!(classify_error_message("AccessDenied: bucket policy").is_permission_denied());
        assert!(classify_error_message("550 Permission denied").is_permission_denied());
        assert!(classify_error_message("NoSuchKey: the key does not exist").is_not_found());
        assert!(classify_error_message("connection reset by peer").is_transient());
        assert!(matches!(
            classify_error_message("InvalidBucketName"),
            StorageError::Validation(_)
        ));
        assert!(matches!(
            classify_error_message("something odd happened"),
            StorageError::Internal(_)
        ));
    }
}
