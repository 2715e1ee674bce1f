use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::ContentReader;

/// Outcome of a document-oriented upload.
///
/// A successful result always carries `storage_path` and `content_hash`;
/// a failed one always carries `error` and never a `storage_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub success: bool,
    pub storage_path: Option<String>,
    pub file_id: Option<String>,
    pub file_name: String,
    pub content_type: Option<String>,
    pub size: u64,
    pub content_hash: Option<String>,
    pub provider_name: String,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

impl UploadResult {
    #[allow(clippy::too_many_arguments)]
    pub fn succeeded(
        storage_path: String,
        file_id: String,
        file_name: String,
        content_type: Option<String>,
        size: u64,
        content_hash: String,
        provider_name: String,
    ) -> Self {
        Self {
            success: true,
            storage_path: Some(storage_path),
            file_id: Some(file_id),
            file_name,
            content_type,
            size,
            content_hash: Some(content_hash),
            provider_name,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn failed(file_name: impl Into<String>, provider_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            storage_path: None,
            file_id: None,
            file_name: file_name.into(),
            content_type: None,
            size: 0,
            content_hash: None,
            provider_name: provider_name.into(),
            timestamp: Utc::now(),
            error: Some(error.into()),
        }
    }
}

/// Outcome of a document-oriented download. The content stream is only
/// present on success.
pub struct DownloadResult {
    pub success: bool,
    pub storage_path: String,
    pub content_type: Option<String>,
    pub content: Option<ContentReader>,
    pub error: Option<String>,
}

impl std::fmt::Debug for DownloadResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadResult")
            .field("success", &self.success)
            .field("storage_path", &self.storage_path)
            .field("content_type", &self.content_type)
            .field("has_content", &self.content.is_some())
            .field("error", &self.error)
            .finish()
    }
}

/// Success flag plus a human-readable reason, returned by bucket lifecycle
/// and connectivity operations instead of raising.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
}

impl OperationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into() }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BucketInfo {
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub size_bytes: Option<u64>,
    pub object_count: Option<u64>,
}

impl BucketInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created_at: None,
            size_bytes: None,
            object_count: None,
        }
    }
}

/// Persisted bucket identity as the document layer knows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketRecord {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub name: String,
    pub path: String,
}

/// Summary of one live registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSummary {
    pub id: Uuid,
    pub name: String,
    pub kind: crate::models::ProviderKind,
    pub is_default: bool,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_result_invariants() {
        let ok = UploadResult::succeeded(
            "default/d1/abc-report.pdf".to_string(),
            "abc".to_string(),
            "report.pdf".to_string(),
            Some("application/pdf".to_string()),
            42,
            "deadbeef".to_string(),
            "local".to_string(),
        );
        assert!(ok.success);
        assert!(ok.storage_path.is_some() && ok.content_hash.is_some());
        assert!(ok.error.is_none());

        let failed = UploadResult::failed("report.pdf", "local", "disk full");
        assert!(!failed.success);
        assert!(failed.storage_path.is_none());
        assert_eq!(failed.error.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_upload_result_serializes_camel_case() {
        let failed = UploadResult::failed("a.txt", "ftp", "boom");
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["fileName"], "a.txt");
        assert_eq!(json["providerName"], "ftp");
        assert!(json["storagePath"].is_null());
    }
}
