//! Administration utility for configured storage providers
//!
//! Usage: cargo run --bin docstore-admin -- <command>
//!
//! Reads provider records from the database named by DATABASE_URL and runs
//! one storage operation against them: listing providers, connectivity
//! tests, bucket management and single-file transfers.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use docstore::{
    config::Config,
    db::Database,
    services::{FileStorageService, SecretProtector},
    storage::{StorageManager, UploadRequest},
};

#[derive(Parser)]
#[command(name = "docstore-admin")]
#[command(about = "Inspect and exercise configured storage providers")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List live providers and which one is the default
    Providers {
        /// List every stored record, inactive ones included
        #[arg(long)]
        all: bool,
    },

    /// Test connectivity of a provider (the default when omitted)
    Test {
        #[arg(short, long)]
        provider: Option<Uuid>,
    },

    /// List the buckets of a provider
    Buckets {
        #[arg(short, long)]
        provider: Uuid,
    },

    /// Create a bucket (nested names use '/')
    CreateBucket {
        #[arg(short, long)]
        provider: Uuid,
        name: String,
    },

    /// Remove a bucket; --force deletes its contents first
    RemoveBucket {
        #[arg(short, long)]
        provider: Uuid,
        name: String,
        #[arg(long)]
        force: bool,
    },

    /// Upload a local file as a document
    Upload {
        #[arg(short, long)]
        provider: Option<Uuid>,
        /// Document id the object key is derived from
        #[arg(short, long)]
        document: String,
        #[arg(short, long)]
        bucket: Option<String>,
        file: PathBuf,
    },

    /// Download a stored object to a local file
    Download {
        #[arg(short, long)]
        provider: Option<Uuid>,
        storage_path: String,
        output: PathBuf,
    },

    /// Encrypt a secret for storage in a provider record
    Protect {
        /// Print a freshly generated STORAGE_SECRET_KEY instead
        #[arg(long)]
        generate_key: bool,
        value: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    docstore::init_tracing();

    let args = Args::parse();
    let config = Config::from_env()?;

    if let Command::Protect { generate_key, value } = &args.command {
        return protect(&config, *generate_key, value.as_deref());
    }

    let db = Database::new(config.require_database_url()?)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.context("Failed to run database migrations")?;
    let db = Arc::new(db);
    let manager = Arc::new(StorageManager::new(db.clone(), config.storage_settings()?));
    let service = FileStorageService::new(manager.clone());

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            ctrl_c.cancel();
        }
    });

    match args.command {
        Command::Providers { all: true } => {
            let records = db
                .list_storage_providers()
                .await
                .context("Failed to list storage providers")?;
            for record in records {
                println!(
                    "{}  {:<14} {}{}{}",
                    record.id,
                    record.kind.to_string(),
                    record.name,
                    if record.is_default { "  (default)" } else { "" },
                    if record.is_active { "" } else { "  (inactive)" }
                );
            }
        }
        Command::Providers { all: false } => {
            if manager.is_degraded().await {
                warn!("No usable default provider configured; the local fallback is the default");
            }
            for provider in manager.list_providers().await {
                println!(
                    "{}  {:<14} {}{}",
                    provider.id,
                    provider.kind.to_string(),
                    provider.name,
                    if provider.is_default { "  (default)" } else { "" }
                );
            }
        }
        Command::Test { provider } => {
            let wrapper = manager.resolve(provider).await?;
            let result = wrapper.test_connection(&cancel).await;
            report(&format!("{} ({})", wrapper.name(), wrapper.kind()), result.success, &result.message)?;
        }
        Command::Buckets { provider } => {
            for bucket in manager.list_buckets(provider, &cancel).await? {
                let created = bucket
                    .created_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string());
                let size = bucket.size_bytes.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
                let count = bucket.object_count.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
                println!("{:<32} {:<17} {:>12} {:>8}", bucket.name, created, size, count);
            }
        }
        Command::CreateBucket { provider, name } => {
            let result = manager.create_bucket(provider, &name, &cancel).await?;
            report("create-bucket", result.success, &result.message)?;
        }
        Command::RemoveBucket { provider, name, force } => {
            let result = manager.remove_bucket(provider, &name, force, &cancel).await?;
            report("remove-bucket", result.success, &result.message)?;
        }
        Command::Upload {
            provider,
            document,
            bucket,
            file,
        } => {
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| anyhow!("{} has no file name", file.display()))?;
            let mut content = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("Cannot open {}", file.display()))?;

            let mut request = UploadRequest::new(document, file_name);
            if let Some(bucket) = bucket {
                request = request.with_bucket(bucket);
            }

            let result = service.upload_document(provider, request, &mut content, &cancel).await;
            if !result.success {
                return Err(anyhow!(
                    "Upload failed: {}",
                    result.error.unwrap_or_else(|| "unknown error".to_string())
                ));
            }
            info!("Uploaded {} bytes", result.size);
            println!(
                "{}  sha256:{}",
                result.storage_path.unwrap_or_default(),
                result.content_hash.unwrap_or_default()
            );
        }
        Command::Download {
            provider,
            storage_path,
            output,
        } => {
            let mut reader = service.download_file(provider, &storage_path, &cancel).await?;
            let mut file = tokio::fs::File::create(&output)
                .await
                .with_context(|| format!("Cannot create {}", output.display()))?;
            let copied = tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            println!("{} bytes written to {}", copied, output.display());
        }
        Command::Protect { .. } => {}
    }

    Ok(())
}

fn report(label: &str, success: bool, message: &str) -> Result<()> {
    if success {
        println!("{}: OK - {}", label, message);
        Ok(())
    } else {
        error!("{} failed: {}", label, message);
        Err(anyhow!("{}: {}", label, message))
    }
}

fn protect(config: &Config, generate_key: bool, value: Option<&str>) -> Result<()> {
    if generate_key {
        println!("{}", SecretProtector::generate_key());
        return Ok(());
    }

    let value = value.ok_or_else(|| anyhow!("A value to protect is required"))?;
    let key = config
        .storage_secret_key
        .as_deref()
        .ok_or_else(|| anyhow!("STORAGE_SECRET_KEY must be set to protect values"))?;
    let protector = SecretProtector::from_base64_key(key)?;
    println!("{}", protector.protect(value)?);
    Ok(())
}
