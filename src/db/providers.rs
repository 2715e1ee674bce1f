use async_trait::async_trait;
use uuid::Uuid;

use super::{Database, ProviderStore};
use crate::models::ProviderRecord;
use crate::storage::{StorageError, StorageResult};

const PROVIDER_COLUMNS: &str =
    "id, name, kind, is_default, is_active, config, created_at, updated_at";

fn database_error(err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StorageError::ConnectionFailure(format!("Database unavailable: {}", err))
        }
        other => StorageError::Internal(format!("Database query failed: {}", other)),
    }
}

impl Database {
    pub async fn list_storage_providers(&self) -> Result<Vec<ProviderRecord>, sqlx::Error> {
        self.with_retry(|| async move {
            sqlx::query_as::<_, ProviderRecord>(&format!(
                "SELECT {} FROM storage_providers ORDER BY name",
                PROVIDER_COLUMNS
            ))
            .fetch_all(&self.pool)
            .await
        })
        .await
    }

    pub async fn get_storage_provider(&self, id: Uuid) -> Result<Option<ProviderRecord>, sqlx::Error> {
        self.with_retry(|| async move {
            sqlx::query_as::<_, ProviderRecord>(&format!(
                "SELECT {} FROM storage_providers WHERE id = $1",
                PROVIDER_COLUMNS
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
        })
        .await
    }
}

#[async_trait]
impl ProviderStore for Database {
    async fn list_active(&self) -> StorageResult<Vec<ProviderRecord>> {
        let records = self
            .with_retry(|| async move {
                sqlx::query_as::<_, ProviderRecord>(&format!(
                    "SELECT {} FROM storage_providers WHERE is_active = TRUE ORDER BY is_default DESC, created_at",
                    PROVIDER_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await
            })
            .await
            .map_err(database_error)?;
        Ok(records)
    }

    async fn find_by_id(&self, id: Uuid) -> StorageResult<Option<ProviderRecord>> {
        self.get_storage_provider(id).await.map_err(database_error)
    }
}
