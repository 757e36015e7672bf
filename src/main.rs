//! Vitals Sync maintenance CLI
//!
//! Operates directly on the local store; no source or backend is needed.
//!
//! ## Usage
//!
//! ```bash
//! # Open (and migrate) the store
//! vitals-sync migrate
//!
//! # Entry and outbox counts as JSON
//! vitals-sync stats
//!
//! # Delete old synced/failed outbox events
//! vitals-sync prune
//!
//! # Give failed outbox events a fresh attempt budget
//! vitals-sync retry-failed
//!
//! # Erase one user's data and every sync window
//! vitals-sync reset --user user-123
//!
//! # Custom config or storage directory
//! vitals-sync --config /path/to/config.toml --storage-dir /data/vitals stats
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vitals_sync::clock::format_timestamp;
use vitals_sync::db::outbox;
use vitals_sync::{Config, LocalStore, MigrationPlan};

#[derive(Parser, Debug)]
#[command(name = "vitals-sync")]
#[command(about = "Maintenance tool for the vitals-sync local store")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "VITALS_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open the store, applying any pending schema migrations
    Migrate,
    /// Print store statistics as JSON
    Stats,
    /// Delete terminal outbox events past the retention period
    Prune,
    /// Requeue failed outbox events
    RetryFailed,
    /// Erase a user's entries and outbox events and clear sync windows
    Reset {
        #[arg(long)]
        user: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vitals_sync=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(dir) = args.storage_dir {
        config.storage.storage_dir = dir;
    }

    let db_path = config.database_path();
    let store = LocalStore::open(&db_path, &MigrationPlan::current())
        .with_context(|| format!("Failed to open store at {}", db_path.display()))?;

    match args.command {
        Command::Migrate => {
            info!(
                path = %db_path.display(),
                schema_version = store.schema_version(),
                "Store is at current schema"
            );
        }
        Command::Stats => {
            let stats = store.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Prune => {
            let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(config.outbox.retention_days));
            let cutoff = format_timestamp(cutoff);
            let pruned = store.with_conn(|conn| outbox::prune_terminal(conn, &cutoff))?;
            info!(pruned, cutoff = %cutoff, "Outbox pruned");
        }
        Command::RetryFailed => {
            let requeued = store.with_conn(outbox::requeue_failed)?;
            info!(requeued, "Failed outbox events requeued");
        }
        Command::Reset { user } => {
            anyhow::ensure!(!user.trim().is_empty(), "--user must not be empty");
            let summary = store.erase_user_data(&user)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
