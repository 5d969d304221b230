//! StageKV Server Binary
//!
//! Starts the staging server.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use stagekv::store::{BackingStore, LogStore, MemoryStore};
use stagekv::{Config, Engine, Server};
use tracing_subscriber::{fmt, EnvFilter};

/// Backing store selection
#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreKind {
    /// In-memory hash map, lost on exit
    Memory,
    /// Append-only data file under the data directory
    Log,
}

/// StageKV Server
#[derive(Parser, Debug)]
#[command(name = "stagekv-server")]
#[command(about = "Remote-write staging server for a key/value store")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./stagekv_data")]
    data_dir: PathBuf,

    /// Listen address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:9876")]
    listen: String,

    /// Maximum concurrent connections
    #[arg(short, long, default_value = "1024")]
    max_connections: usize,

    /// Chunk size in KiB
    #[arg(long, default_value = "32")]
    chunk_kb: usize,

    /// Number of chunk slots
    #[arg(long, default_value = "256")]
    chunks: usize,

    /// Max in-flight durable log writes
    #[arg(long, default_value = "64")]
    io_depth: usize,

    /// Ring log capacity in MiB
    #[arg(long, default_value = "4096")]
    log_mb: u64,

    /// Sync the ring log after every write
    #[arg(long)]
    sync: bool,

    /// Backing store
    #[arg(long, value_enum, default_value = "memory")]
    store: StoreKind,
}

const STORE_FILENAME: &str = "store.dat";

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,stagekv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("StageKV Server v{}", stagekv::VERSION);
    tracing::info!("Data directory: {}", args.data_dir.display());
    tracing::info!("Listen address: {}", args.listen);

    let config = Config::builder()
        .data_dir(&args.data_dir)
        .listen_addr(&args.listen)
        .max_connections(args.max_connections)
        .chunk_size(args.chunk_kb * 1024)
        .chunk_count(args.chunks)
        .io_queue_depth(args.io_depth)
        .log_capacity(args.log_mb * 1024 * 1024)
        .sync_on_write(args.sync)
        .build();

    let store: Arc<dyn BackingStore> = match args.store {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::Log => match LogStore::open(&args.data_dir.join(STORE_FILENAME), args.sync) {
            Ok(store) => {
                let recovery = store.recovery();
                tracing::info!(
                    "Log store recovered {} records ({} bytes truncated)",
                    recovery.records_recovered,
                    recovery.bytes_truncated
                );
                Arc::new(store)
            }
            Err(e) => {
                tracing::error!("Failed to open log store: {}", e);
                std::process::exit(1);
            }
        },
    };

    let engine = match Engine::open(config.clone(), store) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            tracing::error!("Failed to open engine: {}", e);
            std::process::exit(1);
        }
    };

    let server = match Server::bind(config, Arc::clone(&engine)) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("Failed to start server: {}", e);
            std::process::exit(1);
        }
    };

    // Typing "quit" on stdin stops the server gracefully.
    {
        let server = Arc::clone(&server);
        std::thread::spawn(move || {
            for line in std::io::stdin().lock().lines().map_while(|l| l.ok()) {
                if line.trim() == "quit" {
                    tracing::info!("Shutdown requested");
                    server.shutdown();
                    break;
                }
            }
        });
    }

    if let Err(e) = server.run() {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }

    server.join();
    match engine.shutdown() {
        Ok(stats) => tracing::info!(
            "Flushed {} chunks to the ring log ({} failed)",
            stats.completed,
            stats.failed
        ),
        Err(e) => tracing::error!("Flush pipeline shutdown failed: {}", e),
    }

    tracing::info!("Server stopped");
}
