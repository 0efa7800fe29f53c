//! Cardvault CLI - inspect and maintain a Cardvault store
//!
//! Opens the store described by the configuration file, runs one command
//! and prints its result as JSON.

use anyhow::{Context, Result};
use cardvault::Vault;
use cardvault_common::{Config, Namespace};
use cardvault_dataset::RawDataset;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cardvault")]
#[command(about = "Cardvault storage admin CLI")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "cardvault.toml", env = "CARDVAULT_CONFIG")]
    config: PathBuf,

    /// Data directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ingest a dataset JSON file, replacing the stored dataset
    Ingest {
        /// Path to the dataset file
        file: PathBuf,
    },
    /// Print every record of a partition
    Partition {
        /// Partition key (set code)
        key: String,
    },
    /// Search records by name
    Search {
        /// Case-insensitive substring of the card name
        term: String,
        /// Maximum number of results
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Find a record by uuid or external identifier
    Find {
        /// Identifier to look up
        id: String,
    },
    /// Show dataset, quota and cache status
    Status,
    /// Show estimated storage usage
    Usage,
    /// Remove expired cache entries
    Sweep,
    /// Free storage until writes fit again
    Reclaim {
        /// Purge the whole dataset and cache at once
        #[arg(long)]
        emergency: bool,
    },
    /// Delete the stored dataset
    Clear,
    /// Cache operations
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCommands {
    /// Print a cached value
    Get {
        /// Namespace (price-history, identifier-mapping, metadata)
        namespace: Namespace,
        key: String,
    },
    /// Cache a JSON value
    Set {
        /// Namespace (price-history, identifier-mapping, metadata)
        namespace: Namespace,
        key: String,
        /// JSON value
        value: String,
        /// Lifetime in seconds (defaults to the namespace TTL)
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Delete a cached value
    Delete {
        /// Namespace (price-history, identifier-mapping, metadata)
        namespace: Namespace,
        key: String,
    },
    /// Delete every entry in a namespace
    Clear {
        /// Namespace (price-history, identifier-mapping, metadata)
        namespace: Namespace,
    },
    /// Show cache statistics
    Stats,
}

#[derive(Serialize)]
struct Status {
    state: cardvault_dataset::DatasetState,
    version: Option<String>,
    chunks: usize,
    records: u64,
    last_updated: Option<String>,
    quota: cardvault_cache::QuotaStatus,
    used_bytes: u64,
    budget_bytes: u64,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load config file if it exists; CLI flags take precedence
    let mut config = Config::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    if let Some(data_dir) = args.data_dir {
        config.storage.data_dir = data_dir;
    }
    let log_level = args.log_level.unwrap_or_else(|| config.logging.level.clone());

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Opening store at {}", config.storage.db_path().display());
    let vault = Vault::open(&config).await?;
    vault.start_session().await;

    match args.command {
        Commands::Ingest { file } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let dataset = RawDataset::from_json_slice(&bytes)?;
            print_json(&vault.ingest(&dataset).await?)?;
        }
        Commands::Partition { key } => {
            let records = vault.dataset().get_partition(&key).await?.into_complete()?;
            print_json(&records)?;
        }
        Commands::Search { term, limit } => {
            let records = vault.dataset().search(&term, limit).await?.into_complete()?;
            print_json(&records)?;
        }
        Commands::Find { id } => {
            let record = vault
                .dataset()
                .find_by_external_id(&id)
                .await?
                .into_complete()?;
            print_json(&record)?;
        }
        Commands::Status => {
            let index = vault.dataset().index().await?;
            let quota = vault.engine().quota();
            print_json(&Status {
                state: vault.dataset().state().await?,
                version: index.as_ref().map(|i| i.version.clone()),
                chunks: index.as_ref().map_or(0, |i| i.chunk_count()),
                records: index.as_ref().map_or(0, |i| i.total_records),
                last_updated: index.as_ref().map(|i| i.last_updated.to_rfc3339()),
                quota: vault.cleanup().quota_status().await,
                used_bytes: quota.used_bytes,
                budget_bytes: quota.budget_bytes,
            })?;
        }
        Commands::Usage => {
            print_json(&vault.usage().usage().await?)?;
            print_json(&vault.usage().usage_by_area().await?)?;
        }
        Commands::Sweep => {
            print_json(&vault.cleanup().sweep_expired().await)?;
        }
        Commands::Reclaim { emergency } => {
            if emergency {
                print_json(&vault.cleanup().emergency_reclaim().await)?;
            } else {
                print_json(&vault.cleanup().reclaim().await)?;
            }
        }
        Commands::Clear => {
            print_json(&vault.dataset().clear().await?)?;
        }
        Commands::Cache { action } => match action {
            CacheCommands::Get { namespace, key } => {
                let value = vault
                    .cache()
                    .get_entry::<serde_json::Value>(namespace, &key)
                    .await;
                match value {
                    Some(entry) => print_json(&serde_json::json!({
                        "value": entry.value,
                        "created_at": entry.created_at.to_rfc3339(),
                        "expires_at": entry.expires_at.to_rfc3339(),
                    }))?,
                    None => println!("{namespace}/{key}: not cached"),
                }
            }
            CacheCommands::Set {
                namespace,
                key,
                value,
                ttl_secs,
            } => {
                let value: serde_json::Value =
                    serde_json::from_str(&value).context("value is not valid JSON")?;
                vault
                    .cache_set(namespace, &key, &value, ttl_secs.map(Duration::from_secs))
                    .await?;
                println!("Cached {namespace}/{key}");
            }
            CacheCommands::Delete { namespace, key } => {
                if vault.cache().delete(namespace, &key).await {
                    println!("Deleted {namespace}/{key}");
                } else {
                    println!("{namespace}/{key}: not cached");
                }
            }
            CacheCommands::Clear { namespace } => {
                let removed = vault.cache().clear_namespace(namespace).await?;
                println!("Removed {removed} entries from {namespace}");
            }
            CacheCommands::Stats => {
                print_json(&vault.cache().stats().await?)?;
            }
        },
    }

    Ok(())
}
