//! Hangar Sync Server
//! Serves the one shared planner snapshot that all clients poll and the master writes.

mod api;
mod storage;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use storage::SnapshotStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sync-server")]
#[command(about = "Shared snapshot endpoint for hangar planner clients", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "SYNC_SERVER_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// JSON file holding the snapshot
    #[arg(long, default_value = "sync/data.json")]
    data_file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("hangar_sync=info,sync_server=debug")),
        )
        .init();

    let args = Args::parse();
    info!("Starting Hangar Sync Server...");

    let store = Arc::new(SnapshotStore::open(&args.data_file)?);
    info!("Snapshot file: {}", args.data_file.display());

    let app = api::router(store);

    info!("Listening on http://{}", args.bind);
    info!("  GET  /sync/data                   - Current snapshot");
    info!("  GET  /sync/data?action=timestamp  - Snapshot timestamp");
    info!("  POST /sync/data                   - Replace snapshot (master only)");

    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
