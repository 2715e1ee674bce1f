use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::services::secret_protection::SecretProtector;
use crate::storage::StorageSettings;

const DEFAULT_FALLBACK_PATH: &str = "./uploads/fallback";
const DEFAULT_POOL_SIZE: usize = 8;
const DEFAULT_REMOTE_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_MAX_PROVIDER_CONFIG_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct Config {
    /// Only the admin binary needs a database; library users may inject
    /// their own provider store.
    pub database_url: Option<String>,
    pub fallback_storage_path: PathBuf,
    pub storage_secret_key: Option<String>,
    pub s3_pool_size: usize,
    pub remote_timeout_seconds: u64,
    pub max_provider_config_bytes: usize,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url.as_deref().map(redact_database_url))
            .field("fallback_storage_path", &self.fallback_storage_path)
            .field("storage_secret_key", &self.storage_secret_key.as_ref().map(|_| "***"))
            .field("s3_pool_size", &self.s3_pool_size)
            .field("remote_timeout_seconds", &self.remote_timeout_seconds)
            .field("max_provider_config_bytes", &self.max_provider_config_bytes)
            .finish()
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match non_empty_var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("Invalid value for {}: '{}' ({})", name, raw, e)),
        None => Ok(default),
    }
}

/// Hide the password part of a connection URL for logs.
fn redact_database_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let credentials = &url[scheme_end + 3..at];
            match credentials.split_once(':') {
                Some((user, _)) => format!("{}{}:***{}", &url[..scheme_end + 3], user, &url[at..]),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}

/// `DATABASE_URL` wins; otherwise the URL is assembled from `POSTGRES_*`
/// parts when at least one of them is set.
fn database_url_from_env() -> Result<Option<String>> {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
            return Err(anyhow!(
                "Invalid database URL format: expected postgresql:// or postgres://, got '{}'",
                redact_database_url(&url)
            ));
        }
        return Ok(Some(url));
    }

    let parts = ["POSTGRES_HOST", "POSTGRES_PORT", "POSTGRES_DB", "POSTGRES_USER", "POSTGRES_PASSWORD"];
    if parts.iter().all(|name| env::var(name).is_err()) {
        return Ok(None);
    }

    let host = env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".to_string());
    let database = env::var("POSTGRES_DB").unwrap_or_else(|_| "docstore".to_string());
    let user = env::var("POSTGRES_USER").unwrap_or_else(|_| "docstore".to_string());
    let password = env::var("POSTGRES_PASSWORD").unwrap_or_else(|_| "docstore".to_string());

    Ok(Some(format!("postgresql://{}:{}@{}:{}/{}", user, password, host, port, database)))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => info!("Loaded environment from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => warn!("Ignoring unreadable .env file: {}", e),
        }

        let database_url = database_url_from_env()?;
        let fallback_storage_path = PathBuf::from(
            non_empty_var("FALLBACK_STORAGE_PATH").unwrap_or_else(|| DEFAULT_FALLBACK_PATH.to_string()),
        );
        let storage_secret_key = non_empty_var("STORAGE_SECRET_KEY");

        let s3_pool_size = parse_var("S3_POOL_SIZE", DEFAULT_POOL_SIZE)?;
        if s3_pool_size < 1 {
            return Err(anyhow!("S3_POOL_SIZE must be at least 1"));
        }

        let remote_timeout_seconds = parse_var("REMOTE_TIMEOUT_SECONDS", DEFAULT_REMOTE_TIMEOUT_SECONDS)?;
        if remote_timeout_seconds < 1 {
            return Err(anyhow!("REMOTE_TIMEOUT_SECONDS must be at least 1"));
        }

        let max_provider_config_bytes = parse_var("MAX_PROVIDER_CONFIG_BYTES", DEFAULT_MAX_PROVIDER_CONFIG_BYTES)?;
        if max_provider_config_bytes == 0 {
            return Err(anyhow!("MAX_PROVIDER_CONFIG_BYTES must be positive"));
        }

        let config = Self {
            database_url,
            fallback_storage_path,
            storage_secret_key,
            s3_pool_size,
            remote_timeout_seconds,
            max_provider_config_bytes,
        };
        info!("Configuration loaded: {:?}", config);
        Ok(config)
    }

    /// The URL the admin binary connects with.
    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| anyhow!("DATABASE_URL (or POSTGRES_* variables) must be set"))
    }

    /// Settings for a [`crate::storage::StorageManager`]. Fails when the
    /// secret key is set but unusable.
    pub fn storage_settings(&self) -> Result<StorageSettings> {
        let secret_protector = match self.storage_secret_key.as_deref() {
            Some(key) => Some(Arc::new(
                SecretProtector::from_base64_key(key).context("STORAGE_SECRET_KEY is invalid")?,
            )),
            None => None,
        };

        Ok(StorageSettings {
            fallback_path: self.fallback_storage_path.clone(),
            pool_size: self.s3_pool_size,
            remote_timeout: Duration::from_secs(self.remote_timeout_seconds),
            max_config_bytes: self.max_provider_config_bytes,
            secret_protector,
        })
    }
}
