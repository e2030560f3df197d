//! inventory-syncd: Headless inventory sync daemon.
//!
//! Runs the same sync engine as the app against a local data directory and a
//! shared remote directory, either periodically or once on demand.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use inventory_sync::{EntityKind, PeriodicSync, SyncConfig, SyncEvent};
use inventory_syncd::{FileStore, open_engine};

#[derive(Parser, Debug)]
#[command(name = "inventory-syncd")]
#[command(about = "Inventory cloud sync daemon")]
struct Args {
    /// Directory holding the local store and sync bookkeeping
    #[arg(short, long)]
    data_dir: PathBuf,

    /// Shared directory acting as the remote record store
    #[arg(short, long)]
    remote_dir: PathBuf,

    /// Seconds between automatic cycles (overrides INVENTORY_SYNC_INTERVAL_SECS)
    #[arg(long)]
    interval: Option<u64>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync periodically until Ctrl+C (default)
    Run,
    /// Run one cycle and report the outcome
    Sync,
    /// Print the local entities
    List,
    /// Delete an entity locally; the deletion propagates on the next cycle
    Delete {
        #[arg(value_enum)]
        kind: Kind,
        id: Uuid,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
    Item,
    Category,
    Location,
}

impl From<Kind> for EntityKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Item => EntityKind::Item,
            Kind::Category => EntityKind::Category,
            Kind::Location => EntityKind::Location,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,inventory_sync=debug,inventory_syncd=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = SyncConfig::from_env().context("invalid sync configuration")?;
    if let Some(secs) = args.interval {
        if secs == 0 {
            bail!("--interval must be at least 1 second");
        }
        config.interval = std::time::Duration::from_secs(secs);
    }

    info!("Data dir: {:?}", args.data_dir);
    info!("Remote dir: {:?}", args.remote_dir);

    let engine = open_engine(&args.data_dir, &args.remote_dir, config).await?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            let engine = Arc::new(engine);
            let _subscription = engine.events().subscribe(|event| {
                if let SyncEvent::RecordDropped { record, reason } = event {
                    warn!("Dropped {}: {}", record, reason);
                }
            });

            let interval = engine.config().interval;
            let scheduler = PeriodicSync::spawn(engine.clone(), interval);
            info!("Daemon running. Press Ctrl+C to stop.");

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received");
            scheduler.shutdown().await;
        }
        Command::Sync => match engine.trigger_manual_sync().await? {
            Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            None => println!("sync already in progress"),
        },
        Command::List => {
            engine
                .with_store(|store: &mut FileStore| {
                    for kind in EntityKind::ALL {
                        for entity in store.entities(kind) {
                            let meta = entity.meta();
                            println!("{:<9} {} {}", kind.to_string(), meta.id, meta.name);
                        }
                    }
                })
                .await;
        }
        Command::Delete { kind, id } => {
            let removed = engine.delete_local(kind.into(), id).await?;
            if removed == 0 {
                warn!("No local {} with id {}", EntityKind::from(kind), id);
            }
        }
    }

    info!("Shutting down");
    Ok(())
}
