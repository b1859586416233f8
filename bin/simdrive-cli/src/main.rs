//! SimDrive CLI - Admin Command Line Interface
//!
//! This binary manages the drives kept in a SimDrive backing file.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use simdrive_common::{BackendType, DriveIdentity, SeekWhence, StoreConfig};
use simdrive_store::DriveStore;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "simdrive-cli")]
#[command(about = "SimDrive Admin CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "simdrive.toml")]
    config: PathBuf,

    /// Backing file
    #[arg(short, long)]
    path: Option<PathBuf>,

    /// Maximum backing file size in MiB
    #[arg(long)]
    capacity_mb: Option<u64>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a drive
    Add {
        /// Drive identity
        name: String,
        /// Block size in bytes
        #[arg(long, default_value = "520")]
        block_size: u64,
        /// Capacity in blocks
        #[arg(long)]
        max_lba: u64,
    },
    /// Delete a drive
    Delete {
        /// Drive identity
        name: String,
    },
    /// Delete every drive and reset the backing file
    DeleteAll,
    /// List drives
    List,
    /// Write a pattern to a drive
    Write {
        /// Drive identity
        name: String,
        /// First block to write
        #[arg(long, default_value = "0")]
        lba: i64,
        /// Pattern bytes in hex, tiled to fill the unit
        #[arg(long, default_value = "00")]
        pattern: String,
        /// Unit length in blocks
        #[arg(long, default_value = "1")]
        blocks: u64,
        /// Number of times the unit is repeated
        #[arg(long, default_value = "1")]
        repeat: u64,
    },
    /// Read blocks from a drive as a hex dump
    Read {
        /// Drive identity
        name: String,
        /// First block to read
        #[arg(long, default_value = "0")]
        lba: i64,
        /// Number of blocks
        #[arg(long, default_value = "1")]
        blocks: u64,
    },
    /// Show a drive's chunk layout
    Layout {
        /// Drive identity
        name: String,
    },
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    store: Option<StoreConfig>,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Merge CLI args with the config file (CLI takes precedence)
///
/// Commands must outlive the process, so the backend is always the file.
fn store_config(args: &Args, config: Option<StoreConfig>) -> Result<StoreConfig> {
    let mut store = config.unwrap_or_default();
    store.backend = BackendType::File;
    if let Some(path) = &args.path {
        store.path.clone_from(path);
    }
    if let Some(capacity_mb) = args.capacity_mb {
        store.total_capacity_mb = capacity_mb;
    }
    store.validate()?;
    Ok(store)
}

/// Tile hex pattern bytes over `len` bytes
fn build_unit(pattern: &str, len: u64) -> Result<Vec<u8>> {
    let bytes = hex::decode(pattern.trim_start_matches("0x"))
        .with_context(|| format!("invalid hex pattern '{pattern}'"))?;
    if bytes.is_empty() {
        bail!("pattern is empty");
    }
    let len = usize::try_from(len).context("unit too large")?;
    Ok(bytes.iter().copied().cycle().take(len).collect())
}

fn format_size(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load config file if it exists
    let config = load_config(&args.config)?;
    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let store_config = store_config(&args, config.store)?;
    info!("Using drive file {}", store_config.path.display());
    let store = DriveStore::open(store_config).context("failed to open drive store")?;

    match args.command {
        Commands::Add {
            name,
            block_size,
            max_lba,
        } => {
            let identity = DriveIdentity::new(&name)?;
            let index = store.add_drive(identity, block_size, max_lba)?;
            println!("Drive '{name}' added at slot {index}");
            println!("Block size: {block_size}");
            println!("Capacity:   {}", format_size(block_size * max_lba));
        }
        Commands::Delete { name } => {
            store.delete_drive(&DriveIdentity::new(&name)?)?;
            println!("Drive '{name}' deleted");
        }
        Commands::DeleteAll => {
            store.delete_all_drives()?;
            println!("All drives deleted");
        }
        Commands::List => {
            let drives = store.drives();
            println!("Drives");
            println!("======");
            if drives.is_empty() {
                println!("No drives found");
            } else {
                println!(
                    "{:<32} {:<10} {:<12} {:<12} {:<8}",
                    "NAME", "BLOCK", "CAPACITY", "MAPPED", "CHUNKS"
                );
                println!("{}", "-".repeat(78));
                for drive in drives {
                    println!(
                        "{:<32} {:<10} {:<12} {:<12} {:<8}",
                        drive.identity.name(),
                        drive.block_size,
                        format_size(drive.block_size * drive.max_lba),
                        format_size(drive.mapped_bytes),
                        drive.chunk_count,
                    );
                }
            }
        }
        Commands::Write {
            name,
            lba,
            pattern,
            blocks,
            repeat,
        } => {
            let identity = DriveIdentity::new(&name)?;
            let info = store.drive_info(&identity)?;
            let unit = build_unit(&pattern, blocks * info.block_size)?;

            let handle = store.open_handle(&identity)?;
            store.lseek(handle, lba, SeekWhence::Begin)?;
            let written = store.write(handle, &unit, repeat)?;
            store.close_handle(handle)?;
            store.sync()?;
            println!("Wrote {} at block {lba} of '{name}'", format_size(written));
        }
        Commands::Read { name, lba, blocks } => {
            let identity = DriveIdentity::new(&name)?;
            let handle = store.open_handle(&identity)?;
            let start = store.lseek(handle, lba, SeekWhence::Begin)?;
            let data = store.read(handle, blocks)?;
            store.close_handle(handle)?;

            for (i, line) in data.chunks(32).enumerate() {
                println!("{:012x}  {}", start + i as u64 * 32, hex::encode(line));
            }
        }
        Commands::Layout { name } => {
            let layout = store.drive_layout(&DriveIdentity::new(&name)?)?;
            println!("Layout of '{name}'");
            println!("==========={}", "=".repeat(name.len()));
            println!(
                "{:<16} {:<16} {:<12} {:<8}",
                "START", "END", "UNIT", "REPEAT"
            );
            for extent in layout {
                println!(
                    "{:<16} {:<16} {:<12} {:<8}",
                    extent.address,
                    extent.end_address(),
                    extent.data_size,
                    extent.repeat_count,
                );
            }
        }
    }

    Ok(())
}
