//! Catalog Sync - supplier catalog to remote shop synchronization
//!
//! Runs one supplier sync per invocation. Exit codes: 0 for a clean run,
//! 2 for a completed run with per-item failures, 1 for a fatal error or an
//! aborted run.

use catalog_sync::config::{RunOptions, SyncConfig};
use catalog_sync::models::RunState;
use catalog_sync::orchestrator::SyncEngine;
use catalog_sync::remote::HttpCatalogClient;
use catalog_sync::store;
use clap::Parser;
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Sync one supplier's catalog into the remote shop
#[derive(Parser, Debug)]
#[command(name = "catalog_sync")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Supplier code to sync (must exist in the configuration)
    #[arg(short, long)]
    supplier: String,

    /// Path to the SQLite state database
    #[arg(short, long, default_value_t = default_db_path())]
    database: String,

    /// Stop after this many records
    #[arg(long)]
    limit: Option<usize>,

    /// Map and classify without touching the remote catalog
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Only re-deliver images for already synced products
    #[arg(long, default_value_t = false)]
    images_only: bool,

    /// Forget delivered images so the next run re-delivers everything
    #[arg(long, default_value_t = false)]
    clear_cache: bool,

    /// Host address the remote uses to pull images from this machine
    #[arg(long)]
    advertise_host: Option<String>,
}

/// Returns the default database path: ~/.local/share/catalog_sync/state.db
fn default_db_path() -> String {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("catalog_sync")
        .join("state.db")
        .to_string_lossy()
        .to_string()
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    std::process::exit(run(args).await);
}

async fn run(args: Args) -> i32 {
    let config = match SyncConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            return 1;
        }
    };
    let Some(profile) = config.supplier(&args.supplier) else {
        log::error!("Unknown supplier '{}'", args.supplier);
        return 1;
    };

    let db_path = PathBuf::from(&args.database);
    if let Some(parent) = db_path.parent() {
        if !parent.exists() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::error!("Failed to create database directory: {}", e);
                return 1;
            }
        }
    }
    let conn = match Connection::open(&db_path) {
        Ok(conn) => conn,
        Err(e) => {
            log::error!("Failed to open database {}: {}", db_path.display(), e);
            return 1;
        }
    };
    if let Err(e) = store::init_schema(&conn) {
        log::error!("Failed to initialize store schema: {}", e);
        return 1;
    }
    if args.clear_cache {
        match store::clear_image_cache(&conn) {
            Ok(removed) => log::info!("Cleared {} cached image deliveries", removed),
            Err(e) => {
                log::error!("Failed to clear image cache: {}", e);
                return 1;
            }
        }
    }
    let conn = Arc::new(Mutex::new(conn));

    let remote = match HttpCatalogClient::new(&config.remote) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            log::error!("Failed to build remote client: {}", e);
            return 1;
        }
    };

    // Ctrl-C flips the shutdown signal; the running sync drains and aborts
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let options = RunOptions {
        limit: args.limit,
        dry_run: args.dry_run,
        images_only: args.images_only,
    };
    let engine = SyncEngine::new(conn, remote, args.advertise_host);

    match engine.run(profile, &options, shutdown_rx).await {
        Ok(run) => match run.state {
            RunState::Aborted => 1,
            _ if run.counters.failed > 0 => 2,
            _ => 0,
        },
        Err(e) => {
            log::error!("Sync failed: {}", e);
            1
        }
    }
}
