//! Optional provider capabilities and the runtime override cache

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::models::ProviderKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StorageCapability {
    BucketListing,
    BucketExistence,
    BucketCreation,
    BucketDeletion,
    NestedBuckets,
    ForceDelete,
    ObjectMetadata,
    ObjectVersioning,
    ObjectAcl,
    BucketAcl,
    BucketLifecycle,
}

impl std::fmt::Display for StorageCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StorageCapability::BucketListing => "bucket_listing",
            StorageCapability::BucketExistence => "bucket_existence",
            StorageCapability::BucketCreation => "bucket_creation",
            StorageCapability::BucketDeletion => "bucket_deletion",
            StorageCapability::NestedBuckets => "nested_buckets",
            StorageCapability::ForceDelete => "force_delete",
            StorageCapability::ObjectMetadata => "object_metadata",
            StorageCapability::ObjectVersioning => "object_versioning",
            StorageCapability::ObjectAcl => "object_acl",
            StorageCapability::BucketAcl => "bucket_acl",
            StorageCapability::BucketLifecycle => "bucket_lifecycle",
        };
        write!(f, "{}", name)
    }
}

use StorageCapability::*;

const HIERARCHICAL_CAPABILITIES: &[StorageCapability] = &[
    BucketListing,
    BucketExistence,
    BucketCreation,
    BucketDeletion,
    NestedBuckets,
    ForceDelete,
    ObjectMetadata,
];

const S3_CAPABILITIES: &[StorageCapability] = &[
    BucketListing,
    BucketExistence,
    BucketCreation,
    BucketDeletion,
    ForceDelete,
    ObjectMetadata,
    ObjectVersioning,
    ObjectAcl,
    BucketAcl,
    BucketLifecycle,
];

const S3_COMPATIBLE_CAPABILITIES: &[StorageCapability] = &[
    BucketListing,
    BucketExistence,
    BucketCreation,
    BucketDeletion,
    ForceDelete,
    ObjectMetadata,
    ObjectVersioning,
];

/// Capabilities a backend kind supports before any runtime observation.
pub fn nominal_capabilities(kind: ProviderKind) -> &'static [StorageCapability] {
    match kind {
        ProviderKind::FileSystem | ProviderKind::Ftp | ProviderKind::Sftp => HIERARCHICAL_CAPABILITIES,
        ProviderKind::S3 => S3_CAPABILITIES,
        ProviderKind::S3Compatible => S3_COMPATIBLE_CAPABILITIES,
    }
}

/// Overrides discovered at runtime, keyed by (provider instance key, capability).
///
/// An entry here always wins over the nominal table. Entries live until the
/// owning provider instance is removed from the registry or the registry is
/// reloaded.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    overrides: RwLock<HashMap<(String, StorageCapability), bool>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, instance_key: &str, capability: StorageCapability) -> Option<bool> {
        let overrides = self.overrides.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        overrides.get(&(instance_key.to_string(), capability)).copied()
    }

    pub fn set(&self, instance_key: &str, capability: StorageCapability, supported: bool) {
        let mut overrides = self.overrides.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        overrides.insert((instance_key.to_string(), capability), supported);
        debug!("Capability override {} = {} for {}", capability, supported, instance_key);
    }

    /// Record that the backend refused `capability` with a permission error.
    ///
    /// Only call this from the branch that observed the refusal for that
    /// exact capability.
    pub fn record_permission_denied(&self, instance_key: &str, capability: StorageCapability) {
        warn!(
            "Permission denied while exercising {} on {}; disabling it for this provider instance",
            capability, instance_key
        );
        self.set(instance_key, capability, false);
    }

    /// Drop every override recorded for one provider instance.
    pub fn clear_instance(&self, instance_key: &str) {
        let mut overrides = self.overrides.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        overrides.retain(|(key, _), _| key != instance_key);
    }

    pub fn clear(&self) {
        let mut overrides = self.overrides.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        overrides.clear();
    }

    pub fn len(&self) -> usize {
        self.overrides.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
