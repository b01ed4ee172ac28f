#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use huddle_common::{Config, Metrics};
use huddle_relay::RelayServer;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "huddle-relay")]
#[command(about = "Huddle relay node - routes session traffic between hosts and clients")]
struct Args {
    /// UDP listen address. The port here overrides the config file.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Path to a JSON config file
    #[arg(long)]
    config: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    huddle_common::init_tracing_with_default(&args.log_level);

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let listen = args
        .listen
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], config.relay.port)));

    info!("starting huddle-relay v{}", env!("CARGO_PKG_VERSION"));

    let metrics = Arc::new(Metrics::new());
    let mut server = RelayServer::bind(listen, config, Arc::clone(&metrics)).await?;

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("shutting down");
    info!("final state: {}", server.snapshot().to_json());
    info!("metrics: {}", serde_json::to_string(&metrics.snapshot())?);

    Ok(())
}
