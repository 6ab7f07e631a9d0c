#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use expgate_core::clock::SystemClock;
use expgate_daemon::config::DaemonConfig;
use expgate_daemon::server::{self, GatewayState};
use expgate_daemon::store::{FsBlobStore, FsRecordStore};

#[derive(Debug, Parser)]
#[command(name = "expgate-daemon")]
#[command(about = "Access gateway for hosted and proxied behavioral experiments")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    #[arg(long, default_value = "./data")]
    data_dir: String,

    /// External base URL participants use; defaults to http://<listen>.
    #[arg(long)]
    public_base_url: Option<String>,

    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(args.log))
        .init();

    std::fs::create_dir_all(&args.data_dir)?;

    let cfg = DaemonConfig {
        public_base_url: args
            .public_base_url
            .unwrap_or_else(|| format!("http://{}", args.listen)),
        ..DaemonConfig::default()
    };
    let data_dir = std::path::Path::new(&args.data_dir);
    let records = Arc::new(FsRecordStore::open(data_dir)?);
    let blobs = Arc::new(FsBlobStore::open(data_dir)?);
    let state = GatewayState::new(cfg, records, Some(blobs), Arc::new(SystemClock))?;

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    tracing::info!(listen = %args.listen, data_dir = %args.data_dir, "starting expgate gateway");

    server::serve(listener, state, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install shutdown handler");
    }
}
