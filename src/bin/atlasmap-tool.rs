//! AtlasMap Operator Tool
//!
//! Bulk-loads, snapshots and inspects AtlasMap stores.

use std::path::PathBuf;
use std::time::Instant;

use atlasmap::{CodecKind, Result, SnapshotId, Store, StoreConfig};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// AtlasMap Tool
#[derive(Parser, Debug)]
#[command(name = "atlasmap-tool")]
#[command(about = "Load, scan and inspect AtlasMap snapshots")]
#[command(version)]
struct Args {
    /// Snapshot directory
    #[arg(short, long, default_value = "./atlasmap_data")]
    data_dir: PathBuf,

    /// Block compression codec (none, lz4, lz4hc, zstd)
    #[arg(short, long, default_value = "none")]
    codec: CodecKind,

    /// Leaf block size in bytes
    #[arg(short, long, default_value = "4096")]
    block_size: usize,

    /// Memory limit in MB
    #[arg(short = 'm', long, default_value = "1024")]
    memory_mb: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load KEY1..KEYn with values VALUE1..VALUEn
    Load {
        /// Number of records
        #[arg(short = 'n', long, default_value = "100000")]
        count: u64,

        /// Write a snapshot after loading
        #[arg(short, long)]
        snapshot: bool,
    },

    /// Print records from a snapshot
    Scan {
        /// Snapshot id (latest when omitted)
        #[arg(short, long)]
        id: Option<SnapshotId>,

        /// First key (inclusive)
        #[arg(long)]
        start: Option<String>,

        /// Last key (exclusive)
        #[arg(long)]
        stop: Option<String>,

        /// Only keys with this prefix (overrides start/stop)
        #[arg(short, long)]
        prefix: Option<String>,

        /// Scan in descending key order
        #[arg(short, long)]
        reverse: bool,

        /// Maximum records to print
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Print statistics of a snapshot, or list snapshots
    Stats {
        /// Snapshot id (lists snapshots when omitted)
        #[arg(short, long)]
        id: Option<SnapshotId>,
    },
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,atlasmap=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("AtlasMap Tool v{}", atlasmap::VERSION);
    tracing::info!("Data directory: {}", args.data_dir.display());

    let config = StoreConfig::builder()
        .data_dir(&args.data_dir)
        .codec(args.codec)
        .block_size(args.block_size)
        .memory_limit(args.memory_mb * 1024 * 1024)
        .build();

    let outcome = match args.command {
        Commands::Load { count, snapshot } => load(config, count, snapshot),
        Commands::Scan {
            id,
            start,
            stop,
            prefix,
            reverse,
            limit,
        } => scan(config, id, start, stop, prefix, reverse, limit),
        Commands::Stats { id } => stats(config, id),
    };

    if let Err(e) = outcome {
        tracing::error!("Command failed: {}", e);
        std::process::exit(1);
    }
}

fn load(config: StoreConfig, count: u64, snapshot: bool) -> Result<()> {
    let store = Store::new(config)?;
    let started = Instant::now();
    let mut loaded = 0u64;
    for i in 1..=count {
        let key = format!("KEY{}", i);
        let value = format!("VALUE{}", i);
        if !store.put(key.as_bytes(), value.as_bytes())? {
            tracing::warn!("Memory limit reached after {} records", loaded);
            break;
        }
        loaded += 1;
    }
    tracing::info!("Loaded {} records in {:?}", loaded, started.elapsed());
    println!("{}", store.stats());

    if snapshot {
        let id = store.snapshot()?;
        println!("snapshot id      : {}", id);
    }
    store.dispose()
}

fn latest_snapshot(config: &StoreConfig) -> Result<Option<SnapshotId>> {
    Ok(Store::list_snapshots(&config.data_dir)?.last().copied())
}

fn scan(
    config: StoreConfig,
    id: Option<SnapshotId>,
    start: Option<String>,
    stop: Option<String>,
    prefix: Option<String>,
    reverse: bool,
    limit: usize,
) -> Result<()> {
    let id = match id.map_or_else(|| latest_snapshot(&config), |id| Ok(Some(id)))? {
        Some(id) => id,
        None => {
            println!("no snapshots in {}", config.data_dir.display());
            return Ok(());
        }
    };
    let store = Store::load(config, id)?;
    {
        let scanner = match &prefix {
            Some(p) => store.prefix_scanner(p.as_bytes(), reverse),
            None => store.scanner(
                start.as_deref().map(str::as_bytes),
                stop.as_deref().map(str::as_bytes),
                reverse,
            ),
        };
        for item in scanner.take(limit) {
            let (key, value) = item?;
            println!(
                "{} => {}",
                String::from_utf8_lossy(&key),
                String::from_utf8_lossy(&value)
            );
        }
    }
    store.dispose()
}

fn stats(config: StoreConfig, id: Option<SnapshotId>) -> Result<()> {
    let id = match id {
        Some(id) => id,
        None => {
            let ids = Store::list_snapshots(&config.data_dir)?;
            if ids.is_empty() {
                println!("no snapshots in {}", config.data_dir.display());
            }
            for id in ids {
                println!("snapshot {}", id);
            }
            return Ok(());
        }
    };
    let store = Store::load(config, id)?;
    println!("{}", store.stats());
    println!("visible records  : {}", store.count_records()?);
    store.dispose()
}
