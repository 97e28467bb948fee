//! Standalone relay for whiteboard rooms.
//!
//! Usage: `inkboard-relay [config.toml]`. Without a file the defaults
//! apply (bind 127.0.0.1:9090, in-memory snapshots). Log level comes
//! from `RUST_LOG`, `info` when unset.

use inkboard_collab::config::load_toml;
use inkboard_collab::server::{ServerConfig, SyncServer};
use log::info;

type MainResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[tokio::main]
async fn main() -> MainResult {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading relay config from {path}");
            load_toml::<ServerConfig>(&path)?
        }
        None => ServerConfig::default(),
    };

    info!("Starting Inkboard relay on {}", config.bind_addr);
    if let Some(dir) = &config.storage_path {
        info!("Room snapshots persist under {}", dir.display());
    }

    let server = SyncServer::open(config).await?;
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    let stats = server.stats().await;
    info!(
        "Served {} connections, {} messages, archived {} snapshots",
        stats.total_connections, stats.total_messages, stats.persisted_snapshots
    );
    Ok(())
}
