//! Registry of live storage providers
//!
//! The manager loads provider records lazily on first use, keeps one wrapped
//! instance per active record and swaps an instance out when its record
//! changes. When nothing usable is configured, or loading fails, a local
//! filesystem fallback serves as the default so uploads keep working.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::capability::{CapabilityCache, StorageCapability};
use super::error::{StorageError, StorageResult};
use super::factory::{create_provider, new_instance_key, ProviderContext};
use super::local::FileSystemProvider;
use super::wrapper::ProviderWrapper;
use super::StorageProvider;
use crate::db::ProviderStore;
use crate::models::{
    BucketInfo, FileSystemConfig, OperationResult, ProviderConfig, ProviderKind, ProviderRecord, ProviderSummary,
};
use crate::services::secret_protection::{is_protected, SecretProtector};

/// Id under which the local fallback provider is registered.
pub const FALLBACK_PROVIDER_ID: Uuid = Uuid::nil();
pub const FALLBACK_PROVIDER_NAME: &str = "Local fallback";

/// Runtime knobs the manager and the providers it builds need.
#[derive(Clone)]
pub struct StorageSettings {
    pub fallback_path: PathBuf,
    pub pool_size: usize,
    pub remote_timeout: Duration,
    pub max_config_bytes: usize,
    pub secret_protector: Option<Arc<SecretProtector>>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            fallback_path: PathBuf::from("./uploads/fallback"),
            pool_size: 8,
            remote_timeout: Duration::from_secs(30),
            max_config_bytes: 64 * 1024,
            secret_protector: None,
        }
    }
}

impl std::fmt::Debug for StorageSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSettings")
            .field("fallback_path", &self.fallback_path)
            .field("pool_size", &self.pool_size)
            .field("remote_timeout", &self.remote_timeout)
            .field("max_config_bytes", &self.max_config_bytes)
            .field("secret_protector", &self.secret_protector.as_ref().map(|_| "***"))
            .finish()
    }
}

struct RegistryEntry {
    wrapper: ProviderWrapper,
    name: String,
    kind: ProviderKind,
    is_default: bool,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<Uuid, RegistryEntry>,
    default_id: Option<Uuid>,
}

/// What the previous load saw; decides how loudly the next load logs.
#[derive(Debug, Default, PartialEq)]
struct LoadSnapshot {
    stamps: HashMap<Uuid, DateTime<Utc>>,
}

impl LoadSnapshot {
    fn of(records: &[ProviderRecord]) -> Self {
        Self {
            stamps: records.iter().map(|r| (r.id, r.updated_at)).collect(),
        }
    }

    fn differs_from(&self, other: &LoadSnapshot) -> bool {
        self.stamps.len() != other.stamps.len() || self.stamps != other.stamps
    }
}

pub struct StorageManager {
    store: Arc<dyn ProviderStore>,
    settings: StorageSettings,
    capabilities: Arc<CapabilityCache>,
    registry: RwLock<Registry>,
    /// Serializes (re)initialization. Holds the previous load's snapshot,
    /// `None` until the first load.
    init_lock: Mutex<Option<LoadSnapshot>>,
    initialized: AtomicBool,
}

impl StorageManager {
    pub fn new(store: Arc<dyn ProviderStore>, settings: StorageSettings) -> Self {
        Self {
            store,
            settings,
            capabilities: Arc::new(CapabilityCache::new()),
            registry: RwLock::new(Registry::default()),
            init_lock: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &StorageSettings {
        &self.settings
    }

    pub fn capabilities(&self) -> &Arc<CapabilityCache> {
        &self.capabilities
    }

    async fn ensure_initialized(&self) {
        if self.initialized.load(Ordering::Acquire) {
            return;
        }

        let mut snapshot = self.init_lock.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return;
        }
        self.load_locked(&mut snapshot).await;
        self.initialized.store(true, Ordering::Release);
    }

    /// Build a fresh registry from the store. Never fails: anything that
    /// cannot be loaded is skipped and the fallback fills the gap.
    async fn load_locked(&self, snapshot: &mut Option<LoadSnapshot>) {
        let records = match self.store.list_active().await {
            Ok(records) => records,
            Err(e) => {
                error!("Failed to load storage provider configuration: {}", e);
                Vec::new()
            }
        };

        let current = LoadSnapshot::of(&records);
        let verbose = snapshot.as_ref().map_or(true, |previous| previous.differs_from(&current));
        if verbose {
            info!("Loading {} active storage provider(s)", records.len());
        } else {
            debug!("Storage provider configuration unchanged ({} active)", records.len());
        }

        let mut registry = Registry::default();
        for record in &records {
            match self.build_entry(record).await {
                Ok(entry) => {
                    if verbose {
                        info!(
                            provider_id = %record.id,
                            "Registered {} provider '{}'{}",
                            record.kind,
                            record.name,
                            if record.is_default { " (default)" } else { "" }
                        );
                    }
                    if record.is_default && registry.default_id.is_none() {
                        registry.default_id = Some(record.id);
                    }
                    registry.entries.insert(record.id, entry);
                }
                Err(e) => {
                    error!(provider_id = %record.id, "Skipping storage provider '{}': {}", record.name, e);
                }
            }
        }

        if registry.default_id.is_none() {
            warn!(
                "No usable default storage provider configured; using local fallback at {}",
                self.settings.fallback_path.display()
            );
            registry.entries.insert(FALLBACK_PROVIDER_ID, self.build_fallback().await);
            registry.default_id = Some(FALLBACK_PROVIDER_ID);
        }

        *snapshot = Some(current);
        *self.registry.write().await = registry;
    }

    fn unprotect(&self, config: &mut ProviderConfig) -> StorageResult<()> {
        let protector = self.settings.secret_protector.as_deref();
        config.map_secrets(|value| match protector {
            Some(protector) => protector.unprotect(value),
            None if is_protected(value) => Err(StorageError::Validation(
                "Provider config holds protected secrets but no storage secret key is configured".to_string(),
            )),
            None => Ok(value.to_string()),
        })
    }

    async fn build_entry(&self, record: &ProviderRecord) -> StorageResult<RegistryEntry> {
        let mut config = ProviderConfig::from_json(record.kind, &record.config, self.settings.max_config_bytes)?;
        self.unprotect(&mut config)?;

        let context = ProviderContext {
            id: record.id,
            name: &record.name,
            kind: record.kind,
            capabilities: self.capabilities.clone(),
            settings: &self.settings,
        };
        let provider = create_provider(&context, config)?;
        provider.initialize().await?;

        Ok(RegistryEntry {
            wrapper: ProviderWrapper::new(provider, self.capabilities.clone()),
            name: record.name.clone(),
            kind: record.kind,
            is_default: record.is_default,
            updated_at: record.updated_at,
        })
    }

    async fn build_fallback(&self) -> RegistryEntry {
        let provider = FileSystemProvider::new(
            FALLBACK_PROVIDER_NAME,
            new_instance_key(ProviderKind::FileSystem, FALLBACK_PROVIDER_ID),
            FileSystemConfig {
                root_path: self.settings.fallback_path.to_string_lossy().to_string(),
                create_directory_if_not_exists: true,
            },
            self.capabilities.clone(),
        );
        if let Err(e) = provider.initialize().await {
            // Registered anyway; the first write reports the real problem.
            error!("Failed to prepare fallback storage at {}: {}", self.settings.fallback_path.display(), e);
        }

        RegistryEntry {
            wrapper: ProviderWrapper::new(Arc::new(provider), self.capabilities.clone()),
            name: FALLBACK_PROVIDER_NAME.to_string(),
            kind: ProviderKind::FileSystem,
            is_default: true,
            updated_at: Utc::now(),
        }
    }

    async fn evict(&self, id: Uuid) -> bool {
        let removed = {
            let mut registry = self.registry.write().await;
            let removed = registry.entries.remove(&id);
            if removed.is_some() && registry.default_id == Some(id) {
                registry.default_id = None;
            }
            removed
        };

        match removed {
            Some(entry) => {
                self.capabilities.clear_instance(entry.wrapper.instance_key());
                true
            }
            None => false,
        }
    }

    /// Resolve a provider, re-checking its record before handing it out.
    ///
    /// A record that is inactive, or was live here but has been deleted,
    /// yields [`StorageError::NotActive`]; an id nobody knows is `NotFound`.
    pub async fn get_provider(&self, id: Uuid) -> StorageResult<ProviderWrapper> {
        self.ensure_initialized().await;

        if id == FALLBACK_PROVIDER_ID {
            return self.fallback().await;
        }

        let cached = {
            let registry = self.registry.read().await;
            registry.entries.get(&id).map(|e| (e.wrapper.clone(), e.updated_at))
        };

        let record = match self.store.find_by_id(id).await {
            Ok(record) => record,
            Err(e) => {
                return match cached {
                    Some((wrapper, _)) => {
                        warn!(provider_id = %id, "Could not re-validate provider, serving cached instance: {}", e);
                        Ok(wrapper)
                    }
                    None => Err(e),
                };
            }
        };

        match record {
            None => {
                if self.evict(id).await {
                    info!(provider_id = %id, "Storage provider was deleted; dropped from registry");
                    Err(StorageError::NotActive(id))
                } else {
                    Err(StorageError::NotFound(format!("Storage provider {} not found", id)))
                }
            }
            Some(record) if !record.is_active => {
                if self.evict(id).await {
                    info!(provider_id = %id, "Storage provider was deactivated; dropped from registry");
                }
                Err(StorageError::NotActive(id))
            }
            Some(record) => match cached {
                Some((wrapper, updated_at)) if updated_at == record.updated_at => Ok(wrapper),
                previous => {
                    if previous.is_some() {
                        info!(provider_id = %id, "Storage provider '{}' changed; rebuilding", record.name);
                    }
                    self.replace(record).await
                }
            },
        }
    }

    /// Build an instance for `record` and swap it into the registry.
    async fn replace(&self, record: ProviderRecord) -> StorageResult<ProviderWrapper> {
        let entry = self.build_entry(&record).await.map_err(|e| {
            error!(provider_id = %record.id, "Failed to build storage provider '{}': {}", record.name, e);
            e
        })?;
        let wrapper = entry.wrapper.clone();

        let previous = {
            let mut registry = self.registry.write().await;
            if record.is_default {
                registry.default_id = Some(record.id);
                if let Some(fallback) = registry.entries.remove(&FALLBACK_PROVIDER_ID) {
                    self.capabilities.clear_instance(fallback.wrapper.instance_key());
                }
            } else if registry.default_id == Some(record.id) {
                registry.default_id = None;
            }
            registry.entries.insert(record.id, entry)
        };

        if let Some(previous) = previous {
            self.capabilities.clear_instance(previous.wrapper.instance_key());
        }

        let mut snapshot = self.init_lock.lock().await;
        if let Some(snapshot) = snapshot.as_mut() {
            snapshot.stamps.insert(record.id, record.updated_at);
        }
        Ok(wrapper)
    }

    async fn fallback(&self) -> StorageResult<ProviderWrapper> {
        {
            let registry = self.registry.read().await;
            if let Some(entry) = registry.entries.get(&FALLBACK_PROVIDER_ID) {
                return Ok(entry.wrapper.clone());
            }
        }

        let entry = self.build_fallback().await;
        let mut registry = self.registry.write().await;
        let entry = registry.entries.entry(FALLBACK_PROVIDER_ID).or_insert(entry);
        Ok(entry.wrapper.clone())
    }

    /// The provider flagged default, or the fallback when it is unusable.
    pub async fn get_default_provider(&self) -> StorageResult<ProviderWrapper> {
        self.ensure_initialized().await;

        let default_id = self.registry.read().await.default_id;
        if let Some(id) = default_id.filter(|id| *id != FALLBACK_PROVIDER_ID) {
            match self.get_provider(id).await {
                // A rebuild may have dropped the default flag.
                Ok(wrapper) => {
                    if self.registry.read().await.default_id == Some(id) {
                        return Ok(wrapper);
                    }
                    info!(provider_id = %id, "Storage provider '{}' is no longer the default", wrapper.name());
                }
                Err(e) => {
                    warn!(provider_id = %id, "Default storage provider unavailable, using fallback: {}", e);
                }
            }
        }

        let wrapper = self.fallback().await?;
        self.registry.write().await.default_id = Some(FALLBACK_PROVIDER_ID);
        Ok(wrapper)
    }

    /// Resolve `id`, or the default provider when `None`.
    pub async fn resolve(&self, id: Option<Uuid>) -> StorageResult<ProviderWrapper> {
        match id {
            Some(id) => self.get_provider(id).await,
            None => self.get_default_provider().await,
        }
    }

    /// Drop every instance and load again from the store.
    pub async fn reload(&self) {
        let mut snapshot = self.init_lock.lock().await;
        info!("Reloading storage providers");
        self.capabilities.clear();
        self.load_locked(&mut snapshot).await;
        self.initialized.store(true, Ordering::Release);
    }

    /// Forget one instance; the next access rebuilds it from its record.
    pub async fn remove_from_cache(&self, id: Uuid) {
        if self.evict(id).await {
            debug!(provider_id = %id, "Removed storage provider from registry");
        }

        let mut snapshot = self.init_lock.lock().await;
        if let Some(snapshot) = snapshot.as_mut() {
            snapshot.stamps.remove(&id);
        }
    }

    pub async fn list_providers(&self) -> Vec<ProviderSummary> {
        self.ensure_initialized().await;

        let registry = self.registry.read().await;
        let mut providers: Vec<ProviderSummary> = registry
            .entries
            .iter()
            .map(|(id, entry)| ProviderSummary {
                id: *id,
                name: entry.name.clone(),
                kind: entry.kind,
                is_default: registry.default_id == Some(*id) || (entry.is_default && registry.default_id.is_none()),
                updated_at: entry.updated_at,
            })
            .collect();
        providers.sort_by(|a, b| a.name.cmp(&b.name));
        providers
    }

    pub async fn default_provider_id(&self) -> Option<Uuid> {
        self.ensure_initialized().await;
        self.registry.read().await.default_id
    }

    /// Whether the local fallback is currently serving as default.
    pub async fn is_degraded(&self) -> bool {
        self.default_provider_id().await == Some(FALLBACK_PROVIDER_ID)
    }

    pub async fn supports_capability(&self, id: Uuid, capability: StorageCapability) -> StorageResult<bool> {
        Ok(self.get_provider(id).await?.supports_capability(capability))
    }

    pub async fn list_buckets(&self, id: Uuid, cancel: &CancellationToken) -> StorageResult<Vec<BucketInfo>> {
        self.get_provider(id).await?.list_buckets(cancel).await
    }

    pub async fn bucket_exists(&self, id: Uuid, name: &str, cancel: &CancellationToken) -> StorageResult<bool> {
        self.get_provider(id).await?.bucket_exists(name, cancel).await
    }

    pub async fn create_bucket(&self, id: Uuid, name: &str, cancel: &CancellationToken) -> StorageResult<OperationResult> {
        self.get_provider(id).await?.create_bucket(name, cancel).await
    }

    pub async fn remove_bucket(
        &self,
        id: Uuid,
        name: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> StorageResult<OperationResult> {
        self.get_provider(id).await?.remove_bucket(name, force, cancel).await
    }

    /// Connectivity check for a configured provider. Never raises.
    pub async fn test_connection(&self, id: Uuid, cancel: &CancellationToken) -> OperationResult {
        match self.get_provider(id).await {
            Ok(wrapper) => wrapper.test_connection(cancel).await,
            Err(e) => OperationResult::failure(format!("Cannot resolve storage provider {}: {}", id, e)),
        }
    }

    /// Connectivity check for a configuration that has not been saved.
    ///
    /// Runs against a throwaway capability cache so nothing observed here
    /// leaks into live instances.
    pub async fn test_config(
        &self,
        kind: ProviderKind,
        config: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> OperationResult {
        let result: StorageResult<OperationResult> = async {
            let mut config = ProviderConfig::from_json(kind, config, self.settings.max_config_bytes)?;
            self.unprotect(&mut config)?;

            let context = ProviderContext {
                id: Uuid::new_v4(),
                name: "connection test",
                kind,
                capabilities: Arc::new(CapabilityCache::new()),
                settings: &self.settings,
            };
            let provider = create_provider(&context, config)?;
            Ok(provider.test_connection(cancel).await)
        }
        .await;

        result.unwrap_or_else(|e| OperationResult::failure(format!("Invalid {} configuration: {}", kind, e)))
    }
}
