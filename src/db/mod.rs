//! Persistence of storage provider records

use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::ProviderRecord;
use crate::storage::StorageResult;

pub mod memory;
pub mod providers;

pub use memory::InMemoryProviderStore;

/// Read access to provider records, as the storage manager needs it.
#[async_trait]
pub trait ProviderStore: Send + Sync {
    /// Every record with `is_active` set.
    async fn list_active(&self) -> StorageResult<Vec<ProviderRecord>>;

    /// The record with `id`, active or not.
    async fn find_by_id(&self, id: Uuid) -> StorageResult<Option<ProviderRecord>>;
}

#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    /// Retry a query on pool timeouts and dropped connections.
    pub(crate) async fn with_retry<T, F, Fut>(&self, operation: F) -> std::result::Result<T, sqlx::Error>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        const MAX_RETRIES: u32 = 3;
        const BASE_DELAY_MS: u64 = 100;

        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if attempt < MAX_RETRIES && is_retryable(&e) => {
                    let delay_ms = BASE_DELAY_MS * 2u64.pow(attempt);
                    warn!(
                        "Database operation failed (attempt {}/{}), retrying in {}ms: {}",
                        attempt + 1,
                        MAX_RETRIES + 1,
                        delay_ms,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_retryable(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_))
}
