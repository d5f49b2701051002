//! flushkv demo binary
//!
//! Writes a synthetic workload into a fresh engine and flushes it, printing
//! what ended up on disk.

use clap::{Parser, ValueEnum};
use flushkv::{Config, Engine, FlushReason, MempurgePolicy, DEFAULT_COLUMN_FAMILY};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Policy {
    Disabled,
    Always,
    Alternate,
}

impl From<Policy> for MempurgePolicy {
    fn from(p: Policy) -> Self {
        match p {
            Policy::Disabled => MempurgePolicy::Disabled,
            Policy::Always => MempurgePolicy::Always,
            Policy::Alternate => MempurgePolicy::Alternate,
        }
    }
}

/// flushkv
#[derive(Parser, Debug)]
#[command(name = "flushkv")]
#[command(about = "Memtable flush demo for an LSM key-value store")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./flushkv_data")]
    data_dir: String,

    /// Write buffer size in KB
    #[arg(short = 'b', long, default_value = "64")]
    write_buffer_kb: usize,

    /// Number of distinct keys
    #[arg(short, long, default_value = "1000")]
    keys: usize,

    /// Times each key is overwritten
    #[arg(short, long, default_value = "3")]
    rounds: usize,

    /// Mempurge policy for buffer-full flushes
    #[arg(short, long, value_enum, default_value = "disabled")]
    mempurge: Policy,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,flushkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("flushkv v{}", flushkv::VERSION);
    tracing::info!("Data directory: {}", args.data_dir);

    let config = Config::builder()
        .data_dir(&args.data_dir)
        .write_buffer_size(args.write_buffer_kb * 1024)
        .mempurge_policy(args.mempurge.into())
        .measure_io_stats(true)
        .build();

    let engine = match Engine::open(config) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!("Failed to open engine: {}", e);
            std::process::exit(1);
        }
    };

    for round in 0..args.rounds {
        for i in 0..args.keys {
            let key = format!("key{:08}", i);
            let value = format!("value{}-{}", i, round);
            if let Err(e) = engine.put(DEFAULT_COLUMN_FAMILY, key.as_bytes(), value.as_bytes()) {
                tracing::error!("Write failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    match engine.flush(DEFAULT_COLUMN_FAMILY, FlushReason::ManualFlush) {
        Ok(outcome) if outcome.is_ok() => {}
        Ok(outcome) => tracing::warn!(
            status = ?outcome.status,
            io_status = ?outcome.io_status,
            "final flush did not succeed"
        ),
        Err(e) => tracing::error!("Flush failed: {}", e),
    }

    let files = engine.level0_files(DEFAULT_COLUMN_FAMILY);
    println!("level-0 files: {}", files.len());
    for f in &files {
        println!(
            "  #{:06} {} bytes, {} entries, seq {}..={}",
            f.number(),
            f.file_size(),
            f.num_entries,
            f.fd.smallest_seqno,
            f.fd.largest_seqno
        );
    }

    if let Err(e) = engine.close() {
        tracing::error!("Close failed: {}", e);
        std::process::exit(1);
    }
}
