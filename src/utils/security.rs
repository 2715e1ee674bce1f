//! Security utilities for input validation and sanitization

use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::storage::error::{StorageError, StorageResult};

/// Characters that cannot appear in a single path segment on any backend we
/// write to (Windows hosts included).
const INVALID_SEGMENT_CHARS: [char; 9] = ['<', '>', ':', '"', '|', '?', '*', '\\', '\0'];

/// Normalize a backend-relative storage path to forward slashes.
///
/// Rejects null bytes, `..` segments and overlong paths; strips leading
/// slashes and collapses empty and `.` segments.
pub fn normalize_storage_path(input_path: &str) -> StorageResult<String> {
    if input_path.contains('\0') {
        return Err(StorageError::Validation("Path contains null bytes".to_string()));
    }

    if input_path.len() > 4096 {
        return Err(StorageError::Validation("Path too long (max 4096 characters)".to_string()));
    }

    let unified = input_path.replace('\\', "/");
    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                warn!("Path traversal attempt detected: {}", input_path);
                return Err(StorageError::Validation("Path traversal not allowed".to_string()));
            }
            s => {
                if s.chars().any(|ch| ch.is_control()) {
                    return Err(StorageError::Validation("Path contains control characters".to_string()));
                }
                segments.push(s);
            }
        }
    }

    if segments.is_empty() {
        return Err(StorageError::Validation("Path cannot be empty".to_string()));
    }

    Ok(segments.join("/"))
}

/// Sanitize filename by replacing problematic characters
pub fn sanitize_filename(filename: &str) -> String {
    let mut sanitized = String::new();

    for ch in filename.chars() {
        match ch {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' | '/' | '\\' => sanitized.push('_'),
            _ if !ch.is_control() => sanitized.push(ch),
            _ => {}
        }
    }

    let trimmed = sanitized.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Validate a bucket name. Nested names use `/` as the separator and are
/// only accepted when the backend supports nested buckets.
pub fn validate_bucket_name(name: &str, allow_nested: bool) -> StorageResult<()> {
    if name.trim().is_empty() {
        return Err(StorageError::Validation("Bucket name cannot be empty".to_string()));
    }

    if name.len() > 255 {
        return Err(StorageError::Validation("Bucket name too long (max 255 characters)".to_string()));
    }

    let segments: Vec<&str> = name.trim_matches('/').split('/').collect();
    if segments.len() > 1 && !allow_nested {
        return Err(StorageError::UnsupportedOperation(format!(
            "Nested bucket '{}' is not supported by this provider",
            name
        )));
    }

    for segment in segments {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(StorageError::Validation(format!("Invalid bucket name segment in '{}'", name)));
        }
        if let Some(bad) = segment
            .chars()
            .find(|ch| INVALID_SEGMENT_CHARS.contains(ch) || ch.is_control())
        {
            return Err(StorageError::Validation(format!(
                "Bucket name '{}' contains invalid character {:?}",
                name, bad
            )));
        }
    }

    Ok(())
}

/// Normalize a path by resolving . and .. components without filesystem access
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Normal(_) | Component::RootDir | Component::Prefix(_) => {
                normalized.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if normalized.parent().is_some() {
                    normalized.pop();
                }
            }
        }
    }

    normalized
}

/// Resolve symlinks in the longest existing prefix of a normalized path and
/// append the missing tail unchanged.
fn resolve_existing_prefix(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path;
    let mut tail = Vec::new();
    while std::fs::symlink_metadata(existing).is_err() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(path.to_path_buf()),
        }
    }

    let mut resolved = existing.canonicalize()?;
    for name in tail.iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

/// Join `relative` onto `root` and verify the result stays inside `root`,
/// both lexically and after following symlinks that already exist.
pub fn resolve_within_root(root: &Path, relative: &str) -> StorageResult<PathBuf> {
    let current_dir = std::env::current_dir().unwrap_or_default();

    let absolute_root = if root.is_absolute() {
        root.to_path_buf()
    } else {
        current_dir.join(root)
    };
    let canonical_root = normalize_path(&absolute_root);

    // Raw join so that any `..` in the input is resolved lexically and caught below.
    let candidate = normalize_path(&canonical_root.join(relative.trim_start_matches(['/', '\\'])));

    debug!(
        "Path validation: relative='{}', root='{}', resolved='{}'",
        relative,
        canonical_root.display(),
        candidate.display()
    );

    fn escapes(resolved: &Path, base: &Path) -> bool {
        !resolved.starts_with(base) || resolved == base
    }
    let reject = || {
        warn!("Rejected path '{}' escaping root '{}'", relative, root.display());
        StorageError::Validation(format!("Path '{}' is not within the storage root", relative))
    };

    if escapes(&candidate, &canonical_root) {
        return Err(reject());
    }

    let real_root = resolve_existing_prefix(&canonical_root)?;
    // A dangling link cannot be canonicalized; treat it as leaving the root.
    let real_candidate = resolve_existing_prefix(&candidate).map_err(|_| reject())?;
    if escapes(&real_candidate, &real_root) {
        debug!("Path '{}' resolves to '{}' through a symlink", relative, real_candidate.display());
        return Err(reject());
    }

    Ok(candidate)
}

/// Mask a secret for logging, keeping at most two leading characters.
pub fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let visible: String = secret.chars().take(2).collect();
    if secret.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", visible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_storage_path() {
        assert_eq!(normalize_storage_path("docs/a.pdf").unwrap(), "docs/a.pdf");
        assert_eq!(normalize_storage_path("/docs//./a.pdf").unwrap(), "docs/a.pdf");
        assert_eq!(normalize_storage_path("docs\\sub\\a.pdf").unwrap(), "docs/sub/a.pdf");

        assert!(normalize_storage_path("../../../etc/passwd").is_err());
        assert!(normalize_storage_path("docs/../config.txt").is_err());
        assert!(normalize_storage_path("file\0name.txt").is_err());
        assert!(normalize_storage_path("//").is_err());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("file<>name.txt"), "file__name.txt");
        assert_eq!(sanitize_filename("  report.pdf  "), "report.pdf");
        assert_eq!(sanitize_filename("a/b\\c.doc"), "a_b_c.doc");
        assert_eq!(sanitize_filename(".."), "file");
    }

    #[test]
    fn test_validate_bucket_name() {
        assert!(validate_bucket_name("invoices", false).is_ok());
        assert!(validate_bucket_name("2024/q1", true).is_ok());

        assert!(matches!(
            validate_bucket_name("a/b", false),
            Err(StorageError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            validate_bucket_name("bad:name", true),
            Err(StorageError::Validation(_))
        ));
        assert!(validate_bucket_name("a/../b", true).is_err());
        assert!(validate_bucket_name("", true).is_err());
    }

    #[test]
    fn test_resolve_within_root() {
        let root = Path::new("/data");
        assert_eq!(
            resolve_within_root(root, "default/d1/x.pdf").unwrap(),
            PathBuf::from("/data/default/d1/x.pdf")
        );
        assert!(resolve_within_root(root, "../etc/passwd").is_err());
        assert!(resolve_within_root(root, "a/../../outside.txt").is_err());
        assert!(resolve_within_root(root, "").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_within_root_follows_symlinks() {
        use std::os::unix::fs::symlink;

        let temp = tempfile::TempDir::new().unwrap();
        let store = temp.path().join("store");
        let outside = temp.path().join("outside");
        std::fs::create_dir_all(&store).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("secret.txt"), b"secret").unwrap();

        symlink(&outside, store.join("link")).unwrap();
        assert!(resolve_within_root(&store, "link/secret.txt").is_err());
        assert!(resolve_within_root(&store, "link/new/file.txt").is_err());

        symlink(outside.join("missing.txt"), store.join("dangling.txt")).unwrap();
        assert!(resolve_within_root(&store, "dangling.txt").is_err());

        // Links that stay inside, and a linked root itself, are fine.
        std::fs::create_dir_all(store.join("real")).unwrap();
        symlink(store.join("real"), store.join("alias")).unwrap();
        assert!(resolve_within_root(&store, "alias/a.pdf").is_ok());

        let linked_root = temp.path().join("root-link");
        symlink(&store, &linked_root).unwrap();
        assert_eq!(
            resolve_within_root(&linked_root, "default/a.pdf").unwrap(),
            linked_root.join("default/a.pdf")
        );
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "");
        assert_eq!(mask_secret("abc"), "****");
        assert_eq!(mask_secret("supersecret"), "su****");
    }
}
