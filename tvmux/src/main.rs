mod api;
mod server;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use tvmux_core::{
    bootstrap::{init_redis, load_config},
    logging,
};

use server::{Server, Services};

#[derive(Debug, Parser)]
#[command(name = "tvmux", version, about = "IPTV stream session orchestrator")]
struct Cli {
    /// Config file; overrides TVMUX_CONFIG_PATH and the default search paths
    #[arg(short, long, env = "TVMUX_CONFIG")]
    config: Option<String>,
}

/// Unique id for this process: hostname plus a random suffix.
fn generate_node_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{hostname}-{}", nanoid::nanoid!(6))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Configuration (validated; fails fast)
    let config = load_config(cli.config.as_deref())?;

    // 2. Logging
    logging::init_logging(&config.logging)?;
    info!("tvmux starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Redis, or single-node in-memory stores
    let redis = init_redis(&config).await?;

    // 4. Services
    let node_id = generate_node_id();
    info!(node_id = %node_id, "Node id assigned");
    let services = Services::build(&config, redis, node_id).await?;

    // 5. Serve until shutdown
    Server::new(config, services).start().await
}
