//! shmhash CLI - one operation against a named segment per invocation
//!
//! Usage:
//!   shmhash <NAME> put KEY VALUE [--ttl SECS]     Store a value
//!   shmhash <NAME> replace KEY VALUE [--ttl SECS] Overwrite an existing value
//!   shmhash <NAME> get KEY                        Print a value
//!   shmhash <NAME> exists KEY                     Exit 0 if the key is live
//!   shmhash <NAME> del KEY                        Remove a key
//!   shmhash <NAME> count | keys | sweep | stats
//!   shmhash <NAME> destroy                        Remove the segment file
//!
//! Exit status is 0 on success, 1 when the key is missing or the write was
//! refused, and 2 on errors.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shmhash::config::{DEFAULT_CAPACITY, DEFAULT_SLOT_SIZE};
use shmhash::{AttachFlags, DEFAULT_SHM_DIR, Segment, SegmentConfig, ShmHashFile};

#[derive(Parser)]
#[command(name = "shmhash")]
#[command(about = "Inspect and edit shared-memory hash tables", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory holding the segment files
    #[arg(long, default_value = DEFAULT_SHM_DIR)]
    dir: PathBuf,

    /// Slot count used when the segment is created
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    capacity: usize,

    /// Slot size in bytes used when the segment is created
    #[arg(long, default_value_t = DEFAULT_SLOT_SIZE)]
    slot_size: usize,

    /// Milliseconds to wait for the segment lock
    #[arg(long, default_value_t = 1000)]
    lock_timeout_ms: u64,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Segment name
    name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store VALUE under KEY, creating or overwriting it
    Put {
        key: String,
        value: String,
        /// Seconds until the record expires, 0 for never
        #[arg(long, default_value_t = 0)]
        ttl: u32,
    },
    /// Overwrite KEY only if it already holds a live value
    Replace {
        key: String,
        value: String,
        #[arg(long, default_value_t = 0)]
        ttl: u32,
    },
    /// Print the value stored under KEY
    Get { key: String },
    /// Check whether KEY holds a live value
    Exists { key: String },
    /// Remove KEY
    Del { key: String },
    /// Print the number of live keys
    Count,
    /// Print every live key, one per line
    Keys,
    /// Reclaim expired records and print how many were freed
    Sweep,
    /// Print slot occupancy
    Stats,
    /// Remove the segment file
    Destroy,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
    }
}

/// Runs the command; `Ok(false)` means the store answered no.
fn run(cli: Cli) -> Result<bool> {
    if let Command::Destroy = cli.command {
        let removed = Segment::remove(&cli.dir, &cli.name)
            .with_context(|| format!("failed to remove segment '{}'", cli.name))?;
        tracing::info!(name = %cli.name, removed, "destroy");
        return Ok(removed);
    }

    let config = SegmentConfig::default()
        .with_capacity(cli.capacity)
        .with_slot_size(cli.slot_size)
        .with_lock_timeout(Duration::from_millis(cli.lock_timeout_ms));
    let db = ShmHashFile::with_config(config);
    db.try_attach(&cli.dir, &cli.name, AttachFlags::NONE)
        .with_context(|| format!("failed to attach to '{}'", cli.dir.join(&cli.name).display()))?;

    let mut out = io::stdout().lock();
    let answer = match cli.command {
        Command::Put { key, value, ttl } => db
            .put(key.as_bytes(), value.as_bytes(), ttl)
            .with_context(|| format!("put '{key}' failed"))?,
        Command::Replace { key, value, ttl } => db
            .replace(key.as_bytes(), value.as_bytes(), ttl)
            .with_context(|| format!("replace '{key}' failed"))?,
        Command::Get { key } => match db.get(key.as_bytes()).context("get failed")? {
            Some(value) => {
                out.write_all(&value)?;
                writeln!(out)?;
                true
            }
            None => false,
        },
        Command::Exists { key } => db.exists(key.as_bytes()).context("exists failed")?,
        Command::Del { key } => db.delete(key.as_bytes()).context("delete failed")?,
        Command::Count => {
            writeln!(out, "{}", db.count()?)?;
            true
        }
        Command::Keys => {
            for key in db.keys()? {
                out.write_all(&key)?;
                writeln!(out)?;
            }
            true
        }
        Command::Sweep => {
            writeln!(out, "{}", db.sweep()?)?;
            true
        }
        Command::Stats => {
            let stats = db.stats()?;
            writeln!(out, "capacity:    {}", stats.capacity)?;
            writeln!(out, "slot_size:   {}", stats.slot_size)?;
            writeln!(out, "occupied:    {}", stats.occupied)?;
            writeln!(out, "tombstones:  {}", stats.tombstones)?;
            writeln!(out, "load_factor: {:.3}", stats.load_factor())?;
            true
        }
        Command::Destroy => unreachable!("handled before attaching"),
    };

    out.flush()?;
    db.flush().context("flush failed")?;
    Ok(answer)
}

/// Initialize logging based on log level
fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    // stdout carries command output only
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .try_init()
        .ok();
}
