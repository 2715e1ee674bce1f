use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::ProviderStore;
use crate::models::ProviderRecord;
use crate::storage::{StorageError, StorageResult};

/// Provider records held in memory, for tests and embedding without a database.
#[derive(Default)]
pub struct InMemoryProviderStore {
    records: RwLock<HashMap<Uuid, ProviderRecord>>,
    list_calls: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryProviderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, record: ProviderRecord) {
        let mut records = self.records.write().await;
        if record.is_default {
            for other in records.values_mut() {
                other.is_default = false;
            }
        }
        records.insert(record.id, record);
    }

    pub async fn remove(&self, id: Uuid) -> Option<ProviderRecord> {
        self.records.write().await.remove(&id)
    }

    /// Apply `change` to a stored record and bump its `updated_at`.
    pub async fn update<F>(&self, id: Uuid, change: F) -> bool
    where
        F: FnOnce(&mut ProviderRecord),
    {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(record) => {
                change(record);
                record.updated_at = chrono::Utc::now().max(record.updated_at + chrono::Duration::milliseconds(1));
                true
            }
            None => false,
        }
    }

    /// Make every lookup fail as if the backing store were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// How many times the active set has been loaded.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::ConnectionFailure("Provider store is unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderStore for InMemoryProviderStore {
    async fn list_active(&self) -> StorageResult<Vec<ProviderRecord>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let records = self.records.read().await;
        let mut active: Vec<ProviderRecord> = records.values().filter(|r| r.is_active).cloned().collect();
        active.sort_by(|a, b| b.is_default.cmp(&a.is_default).then(a.created_at.cmp(&b.created_at)));
        Ok(active)
    }

    async fn find_by_id(&self, id: Uuid) -> StorageResult<Option<ProviderRecord>> {
        self.check_available()?;
        Ok(self.records.read().await.get(&id).cloned())
    }
}
