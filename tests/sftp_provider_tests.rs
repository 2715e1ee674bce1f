//! SFTP provider against a real server.
//!
//! Runs only when `DOCSTORE_TEST_SFTP_HOST` is set, e.g. against
//! `docker run -p 2222:22 atmoz/sftp docs:secret:::upload`:
//!
//! ```text
//! DOCSTORE_TEST_SFTP_HOST=127.0.0.1 DOCSTORE_TEST_SFTP_PORT=2222 \
//! DOCSTORE_TEST_SFTP_USER=docs DOCSTORE_TEST_SFTP_PASSWORD=secret \
//! DOCSTORE_TEST_SFTP_ROOT=upload cargo test --test sftp_provider_tests
//! ```
#![cfg(feature = "sftp")]

use std::env;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use docstore::models::SftpConfig;
use docstore::storage::hashing::hash_bytes;
use docstore::storage::sftp::SftpProvider;
use docstore::storage::{BucketProvider, CapabilityCache, StorageError, StorageProvider, UploadRequest};

fn provider_from_env() -> Option<SftpProvider> {
    let host = env::var("DOCSTORE_TEST_SFTP_HOST").ok()?;
    let config = SftpConfig {
        host,
        port: env::var("DOCSTORE_TEST_SFTP_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(22),
        username: env::var("DOCSTORE_TEST_SFTP_USER").unwrap_or_else(|_| "docs".to_string()),
        password: env::var("DOCSTORE_TEST_SFTP_PASSWORD").ok(),
        private_key_path: env::var("DOCSTORE_TEST_SFTP_KEY").ok(),
        passphrase: None,
        root_path: env::var("DOCSTORE_TEST_SFTP_ROOT").unwrap_or_else(|_| "upload".to_string()),
        calculate_bucket_size: true,
    };
    Some(SftpProvider::new(
        "sftp",
        "sftp:integration",
        config,
        Duration::from_secs(10),
        Arc::new(CapabilityCache::new()),
    ))
}

#[tokio::test]
async fn test_upload_download_delete_roundtrip() {
    let Some(provider) = provider_from_env() else {
        println!("Skipping SFTP test: DOCSTORE_TEST_SFTP_HOST not set");
        return;
    };
    let cancel = CancellationToken::new();
    assert!(provider.test_connection(&cancel).await.success);

    let data: Vec<u8> = (0..256 * 1024u32).map(|i| (i % 253) as u8).collect();
    let request = UploadRequest::new(uuid::Uuid::new_v4().to_string(), "scan.tiff");
    let result = provider.upload(&request, &mut Cursor::new(data.clone()), &cancel).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.content_hash.as_deref(), Some(hash_bytes(&data).as_str()));

    let storage_path = result.storage_path.unwrap();
    assert!(provider.exists(&storage_path, &cancel).await);
    let stored_hash = provider.compute_hash(&storage_path, &cancel).await.unwrap();
    assert_eq!(Some(stored_hash), result.content_hash);

    provider.delete(&storage_path, &cancel).await.unwrap();
    assert!(!provider.exists(&storage_path, &cancel).await);
    provider.delete(&storage_path, &cancel).await.unwrap();
}

#[tokio::test]
async fn test_bucket_lifecycle() {
    let Some(provider) = provider_from_env() else {
        println!("Skipping SFTP test: DOCSTORE_TEST_SFTP_HOST not set");
        return;
    };
    let cancel = CancellationToken::new();
    let bucket = format!("bucket-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);

    assert!(provider.create_bucket(&bucket, &cancel).await.success);
    assert!(provider.bucket_exists(&bucket, &cancel).await.unwrap());
    provider
        .upload_bytes(&format!("{}/notes.txt", bucket), b"kept", &cancel)
        .await
        .unwrap();

    assert!(!provider.remove_bucket(&bucket, false, &cancel).await.success);
    assert!(provider.remove_bucket(&bucket, true, &cancel).await.success);
    assert!(!provider.bucket_exists(&bucket, &cancel).await.unwrap());
}

#[tokio::test]
async fn test_cancelled_upload_stores_nothing() {
    let Some(provider) = provider_from_env() else {
        println!("Skipping SFTP test: DOCSTORE_TEST_SFTP_HOST not set");
        return;
    };
    let cancel = CancellationToken::new();
    cancel.cancel();
    let path = format!("default/{}/late.txt", uuid::Uuid::new_v4());

    let result = provider.upload_bytes(&path, b"too late", &cancel).await;
    assert!(matches!(result, Err(StorageError::Cancelled)));

    let fresh = CancellationToken::new();
    assert!(!provider.exists(&path, &fresh).await);
}
