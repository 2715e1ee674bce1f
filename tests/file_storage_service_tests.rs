use chrono::Utc;
use serde_json::json;
use std::io::Cursor;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use docstore::db::InMemoryProviderStore;
use docstore::models::{ProviderKind, ProviderRecord};
use docstore::services::FileStorageService;
use docstore::storage::hashing::hash_bytes;
use docstore::storage::transfer::read_to_vec;
use docstore::storage::{StorageError, StorageManager, StorageSettings, UploadRequest};

async fn service_with_provider(temp: &TempDir) -> (FileStorageService, Uuid) {
    let store = Arc::new(InMemoryProviderStore::new());
    let now = Utc::now();
    let id = Uuid::new_v4();
    store
        .upsert(ProviderRecord {
            id,
            name: "documents".to_string(),
            kind: ProviderKind::FileSystem,
            is_default: true,
            is_active: true,
            config: json!({ "rootPath": temp.path().join("documents").to_string_lossy() }),
            created_at: now,
            updated_at: now,
        })
        .await;

    let manager = StorageManager::new(
        store,
        StorageSettings {
            fallback_path: temp.path().join("fallback"),
            ..StorageSettings::default()
        },
    );
    (FileStorageService::new(Arc::new(manager)), id)
}

#[tokio::test]
async fn test_upload_document_fills_content_type_and_round_trips() {
    let temp = TempDir::new().unwrap();
    let (service, id) = service_with_provider(&temp).await;
    let cancel = CancellationToken::new();

    let body = b"%PDF-1.7\nquarterly numbers".to_vec();
    let result = service
        .upload_document(
            Some(id),
            UploadRequest::new("d1", "report.pdf").with_bucket("finance"),
            &mut Cursor::new(body.clone()),
            &cancel,
        )
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.content_type.as_deref(), Some("application/pdf"));
    assert_eq!(result.provider_name, "documents");
    let path = result.storage_path.unwrap();
    assert!(path.starts_with("finance/d1/"));

    let download = service.download_document(Some(id), &path, &cancel).await;
    assert!(download.success);
    assert_eq!(download.content_type.as_deref(), Some("application/pdf"));
    let bytes = read_to_vec(download.content.unwrap()).await.unwrap();
    assert_eq!(bytes, body);

    assert_eq!(service.compute_hash(Some(id), &path, &cancel).await.unwrap(), hash_bytes(&body));
    assert!(service.file_exists(Some(id), &path, &cancel).await);

    service.delete_file(Some(id), &path, &cancel).await.unwrap();
    assert!(!service.file_exists(Some(id), &path, &cancel).await);
}

#[tokio::test]
async fn test_default_provider_is_used_without_id() {
    let temp = TempDir::new().unwrap();
    let (service, _id) = service_with_provider(&temp).await;
    let cancel = CancellationToken::new();

    let path = service
        .upload_bytes(None, "default/raw/blob.bin", b"\x00\x01\x02", &cancel)
        .await
        .unwrap();
    assert_eq!(path, "default/raw/blob.bin");
    assert!(temp.path().join("documents/default/raw/blob.bin").is_file());
}

#[tokio::test]
async fn test_document_calls_report_failures_in_results() {
    let temp = TempDir::new().unwrap();
    let (service, id) = service_with_provider(&temp).await;
    let cancel = CancellationToken::new();

    let unknown = Uuid::new_v4();
    let upload = service
        .upload_document(
            Some(unknown),
            UploadRequest::new("d1", "a.txt"),
            &mut Cursor::new(b"x".to_vec()),
            &cancel,
        )
        .await;
    assert!(!upload.success);
    assert!(upload.storage_path.is_none());
    assert!(upload.error.is_some());

    let traversal = service
        .upload_document(
            Some(id),
            UploadRequest::new("d1", "a.txt").with_object_key("../../escape.txt"),
            &mut Cursor::new(b"x".to_vec()),
            &cancel,
        )
        .await;
    assert!(!traversal.success);

    let download = service.download_document(Some(id), "default/missing.txt", &cancel).await;
    assert!(!download.success);
    assert!(download.content.is_none());
    assert!(download.error.is_some());
}

#[tokio::test]
async fn test_path_calls_propagate_errors() {
    let temp = TempDir::new().unwrap();
    let (service, id) = service_with_provider(&temp).await;
    let cancel = CancellationToken::new();

    assert!(matches!(
        service.download_file(Some(id), "default/missing.txt", &cancel).await,
        Err(StorageError::NotFound(_))
    ));
    assert!(matches!(
        service.upload_bytes(Some(id), "../outside.bin", b"x", &cancel).await,
        Err(StorageError::Validation(_))
    ));
    assert!(service
        .upload_bytes(Some(Uuid::new_v4()), "default/x.bin", b"x", &cancel)
        .await
        .is_err());
}

#[tokio::test]
async fn test_cancelled_upload_reports_failure() {
    let temp = TempDir::new().unwrap();
    let (service, id) = service_with_provider(&temp).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = service
        .upload_document(
            Some(id),
            UploadRequest::new("d9", "big.bin"),
            &mut Cursor::new(vec![7u8; 1024]),
            &cancel,
        )
        .await;
    assert!(!result.success);
    assert!(result.error.unwrap().to_lowercase().contains("cancel"));
}
