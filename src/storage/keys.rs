//! Object key and storage path naming, identical across backends

use uuid::Uuid;

use super::error::StorageResult;
use crate::utils::security::{normalize_storage_path, sanitize_filename};

/// Namespace used when an upload names no bucket.
pub const DEFAULT_NAMESPACE: &str = "default";

/// A freshly derived object key plus the random id embedded in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedKey {
    pub file_id: String,
    pub object_key: String,
}

/// `{documentId}/{newRandomId}-{fileName}`
pub fn generate_object_key(document_id: &str, file_name: &str) -> GeneratedKey {
    let file_id = Uuid::new_v4().to_string();
    let object_key = format!("{}/{}-{}", document_id.trim_matches('/'), file_id, sanitize_filename(file_name));
    GeneratedKey { file_id, object_key }
}

/// Use the caller's key when supplied, otherwise derive a new one.
pub fn resolve_object_key(object_key: Option<&str>, document_id: &str, file_name: &str) -> StorageResult<GeneratedKey> {
    match object_key {
        Some(key) if !key.trim().is_empty() => {
            let object_key = normalize_storage_path(key)?;
            let file_id = object_key
                .rsplit('/')
                .next()
                .unwrap_or(&object_key)
                .to_string();
            Ok(GeneratedKey { file_id, object_key })
        }
        _ => {
            let generated = generate_object_key(document_id, file_name);
            // Re-validate: document ids come from callers.
            normalize_storage_path(&generated.object_key)?;
            Ok(generated)
        }
    }
}

/// `{bucketName}/{objectKey}` or `default/{objectKey}`, forward-slash normalized.
pub fn compose_storage_path(bucket_name: Option<&str>, object_key: &str) -> StorageResult<String> {
    let bucket = bucket_name
        .map(|b| b.trim_matches('/'))
        .filter(|b| !b.is_empty())
        .unwrap_or(DEFAULT_NAMESPACE);
    normalize_storage_path(&format!("{}/{}", bucket, object_key))
}

/// Split a storage path into its first segment (bucket or namespace) and the rest.
pub fn split_storage_path(storage_path: &str) -> StorageResult<(String, String)> {
    let normalized = normalize_storage_path(storage_path)?;
    match normalized.split_once('/') {
        Some((bucket, key)) => Ok((bucket.to_string(), key.to_string())),
        None => Ok((DEFAULT_NAMESPACE.to_string(), normalized)),
    }
}

/// Absolute remote path for a storage path under a server-side root.
pub fn join_remote_path(root: &str, relative: &str) -> String {
    let root = root.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        return if root.is_empty() { "/".to_string() } else { root.to_string() };
    }
    format!("{}/{}", root, relative)
}

/// Every ancestor directory of `path`, shallowest first, excluding `path`.
pub fn remote_ancestors(path: &str) -> Vec<String> {
    let mut ancestors = Vec::new();
    let mut current = String::new();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    for segment in segments.iter().take(segments.len().saturating_sub(1)) {
        if path.starts_with('/') || !current.is_empty() {
            current.push('/');
        }
        current.push_str(segment);
        ancestors.push(current.clone());
    }
    ancestors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_do_not_collide() {
        let first = generate_object_key("d1", "report.pdf");
        let second = generate_object_key("d1", "report.pdf");

        assert!(first.object_key.starts_with("d1/"));
        assert!(first.object_key.ends_with("-report.pdf"));
        assert_ne!(first.object_key, second.object_key);
        assert!(first.object_key.contains(&first.file_id));
    }

    #[test]
    fn test_explicit_key_is_normalized() {
        let key = resolve_object_key(Some("\\docs\\a.pdf"), "d1", "ignored.pdf").unwrap();
        assert_eq!(key.object_key, "docs/a.pdf");
        assert_eq!(key.file_id, "a.pdf");

        assert!(resolve_object_key(Some("../escape"), "d1", "x").is_err());
        assert!(resolve_object_key(None, "../d1", "x").is_err());
    }

    #[test]
    fn test_compose_storage_path() {
        assert_eq!(compose_storage_path(Some("invoices"), "d1/x.pdf").unwrap(), "invoices/d1/x.pdf");
        assert_eq!(compose_storage_path(None, "d1/x.pdf").unwrap(), "default/d1/x.pdf");
        assert_eq!(compose_storage_path(Some(""), "d1/x.pdf").unwrap(), "default/d1/x.pdf");
        assert_eq!(compose_storage_path(Some("/2024/q1/"), "x").unwrap(), "2024/q1/x");
    }

    #[test]
    fn test_split_storage_path() {
        assert_eq!(
            split_storage_path("invoices/d1/x.pdf").unwrap(),
            ("invoices".to_string(), "d1/x.pdf".to_string())
        );
        assert_eq!(
            split_storage_path("loose.txt").unwrap(),
            ("default".to_string(), "loose.txt".to_string())
        );
    }

    #[test]
    fn test_join_remote_path() {
        assert_eq!(join_remote_path("/", "default/a.txt"), "/default/a.txt");
        assert_eq!(join_remote_path("/srv/docs/", "b/c"), "/srv/docs/b/c");
        assert_eq!(join_remote_path("uploads", "x"), "uploads/x");
        assert_eq!(join_remote_path("/", ""), "/");
    }

    #[test]
    fn test_remote_ancestors() {
        assert_eq!(remote_ancestors("/srv/docs/a.txt"), vec!["/srv", "/srv/docs"]);
        assert_eq!(remote_ancestors("uploads/d1/x"), vec!["uploads", "uploads/d1"]);
        assert!(remote_ancestors("/top.txt").is_empty());
    }
}
