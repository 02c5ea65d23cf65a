// Banan Stats - web traffic analytics
//
// Two processes share this binary:
// - `proxy`: an intercepting reverse proxy that manages the visitor tracking
//   cookie, buffers one event per loggable response in a durable disk queue,
//   and streams batches to the sidecar.
// - `sidecar`: receives event batches, enriches them with the user-agent
//   analyzer, stores them in the analytical database, and serves the
//   server-rendered dashboard.

mod analyzer;
mod cli;
mod config;
mod events;
mod proxy;
mod queue;
mod sidecar;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use config::ProxyConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "banan_stats=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Proxy { config } => {
            let config = ProxyConfig::load(config.as_deref())?;
            proxy::run(config).await
        }
        Commands::Sidecar { db_path, listen } => sidecar::run(&db_path, &listen).await,
    }
}
