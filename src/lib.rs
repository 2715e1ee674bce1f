//! Pluggable document storage: one provider contract over local disk, FTP,
//! SFTP and S3-compatible object storage, with a registry that loads
//! provider configurations from a store and keeps live instances current.

pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod storage;
pub mod utils;

#[cfg(test)]
mod tests;

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber. Honours `RUST_LOG`, `info`
/// otherwise. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
