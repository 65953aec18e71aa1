//! rivven-ingest - Operator CLI for coordinated CDC ingestion
//!
//! Inspects and maintains the partition-state store shared by ingestion
//! workers. Workers themselves are embedded by connectors through the
//! library API.
//!
//! # Usage
//!
//! ```bash
//! # Check collections and settings
//! rivven-ingest -c rivven-ingest.yaml validate
//!
//! # Create partition records ahead of the first worker
//! rivven-ingest -c rivven-ingest.yaml register
//!
//! # Print the JSON schema of the configuration file
//! rivven-ingest schema
//!
//! # Show leases and checkpoints
//! rivven-ingest -c rivven-ingest.yaml status --json
//!
//! # Hand back the partitions of a crashed worker before its leases expire
//! rivven-ingest -c rivven-ingest.yaml release --owner worker-3f2a...
//!
//! # Retire a collection that is no longer ingested
//! rivven-ingest -c rivven-ingest.yaml decommission shop.legacy_orders
//! ```

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use rivven_ingest::{
    Clock, CollectionValidator, OwnerId, PartitionCoordinator, PartitionKey, PartitionRecord,
    SourceConfig, SystemClock,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "rivven-ingest")]
#[command(version, about = "Operator tooling for Rivven coordinated ingestion")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "rivven-ingest.yaml")]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration and list the partitions it defines
    Validate,
    /// Register configured partitions in the state store
    Register,
    /// Show partition leases and checkpoints
    Status {
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Release every partition held by a worker
    Release {
        /// Lease owner to release
        #[arg(long)]
        owner: String,
    },
    /// Mark a partition done and revoke its lease
    Decommission {
        /// Partition key (`database.collection`)
        partition: String,
    },
    /// Print the configuration JSON schema
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Commands::Schema = cli.command {
        println!("{}", serde_json::to_string_pretty(&SourceConfig::schema_json())?);
        return Ok(());
    }

    let config = SourceConfig::from_file(&cli.config)
        .await
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Validate => validate(&config),
        Commands::Register => register(&config).await,
        Commands::Status { json } => status(&config, json).await,
        Commands::Release { owner } => release(&config, OwnerId::new(owner)).await,
        Commands::Decommission { partition } => {
            decommission(&config, PartitionKey::new(partition)).await
        }
        Commands::Schema => Ok(()),
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn coordinator(config: &SourceConfig) -> Result<PartitionCoordinator> {
    let store = config
        .store
        .open()
        .await
        .context("Failed to open partition-state store")?;
    Ok(PartitionCoordinator::new(
        store,
        Arc::new(SystemClock),
        config.lease.clone(),
    ))
}

fn validate(config: &SourceConfig) -> Result<()> {
    config.validate_config().context("Invalid settings")?;
    let specs = CollectionValidator::validate(config).context("Invalid collections")?;

    println!("✓ Configuration valid!\n");
    println!("Partitions:");
    for spec in &specs {
        println!(
            "  {:<40} mode={:<20} initial={}",
            spec.partition.as_str(),
            spec.mode.as_str(),
            spec.initial_phase
        );
    }
    println!();
    println!("Lease: {}ms (renew every {}ms)", config.lease.duration_ms, config.lease.renew_interval_ms);
    println!(
        "Acknowledgements: {}",
        if config.acknowledgments {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!("Max partitions per worker: {}", config.acquisition.max_partitions);
    Ok(())
}

async fn register(config: &SourceConfig) -> Result<()> {
    config.validate_config().context("Invalid settings")?;
    let specs = CollectionValidator::validate(config).context("Invalid collections")?;
    let coordinator = coordinator(config).await?;

    let created = coordinator
        .register_partitions(&specs)
        .await
        .context("Failed to register partitions")?;
    info!(created, total = specs.len(), "Registration finished");
    println!("Registered {} new partition(s), {} configured", created, specs.len());
    Ok(())
}

async fn status(config: &SourceConfig, json: bool) -> Result<()> {
    let coordinator = coordinator(config).await?;
    let records = coordinator
        .partitions()
        .await
        .context("Failed to list partitions")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No partitions registered");
        return Ok(());
    }

    println!(
        "{:<32} {:<20} {:<16} {:<24} {:<22} {:>9} {:>6} {:>10} {:>10} {:>7}",
        "PARTITION",
        "MODE",
        "PHASE",
        "OWNER",
        "LEASE EXPIRES",
        "REMAINING",
        "SEQ",
        "EXPORTED",
        "STREAMED",
        "RESYNCS"
    );
    let now_ms = SystemClock.now_millis();
    for record in &records {
        print_record(record, now_ms);
    }
    Ok(())
}

fn print_record(record: &PartitionRecord, now_ms: i64) {
    let (owner, expires, remaining) = match &record.lease {
        Some(lease) => (
            lease.owner.to_string(),
            chrono::DateTime::from_timestamp_millis(lease.expires_at_ms)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| lease.expires_at_ms.to_string()),
            format!("{}s", lease.remaining_ms(now_ms) / 1_000),
        ),
        None => ("-".to_string(), "-".to_string(), "-".to_string()),
    };
    let progress = &record.progress;
    println!(
        "{:<32} {:<20} {:<16} {:<24} {:<22} {:>9} {:>6} {:>10} {:>10} {:>7}",
        record.partition.as_str(),
        record.mode.as_str(),
        progress.phase.name(),
        owner,
        expires,
        remaining,
        progress.checkpoint_seq,
        progress.records_exported,
        progress.records_streamed,
        progress.resyncs
    );
}

async fn release(config: &SourceConfig, owner: OwnerId) -> Result<()> {
    let coordinator = coordinator(config).await?;
    let released = coordinator
        .give_up_all_partitions(&owner)
        .await
        .with_context(|| format!("Failed to release partitions of {}", owner))?;
    println!("Released {} partition(s) held by {}", released, owner);
    Ok(())
}

async fn decommission(config: &SourceConfig, partition: PartitionKey) -> Result<()> {
    let coordinator = coordinator(config).await?;
    let record = coordinator
        .decommission_partition(&partition)
        .await
        .with_context(|| format!("Failed to decommission {}", partition))?;
    println!(
        "Decommissioned {} at checkpoint {}",
        record.partition, record.progress.checkpoint_seq
    );
    Ok(())
}
