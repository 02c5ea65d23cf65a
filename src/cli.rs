// CLI - subcommands for the two processes
//
// `proxy` runs the intercepting reverse proxy (middleware side),
// `sidecar` runs the ingest server and dashboard.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Web traffic analytics: intercepting proxy + stats sidecar
#[derive(Parser)]
#[command(name = "banan-stats")]
#[command(version = VERSION)]
#[command(about = "Web traffic analytics: intercepting proxy + stats sidecar", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the intercepting reverse proxy
    Proxy {
        /// Path to the TOML config file (default: ./banan-stats.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run the stats sidecar (ingest + dashboard)
    Sidecar {
        /// Stats database file
        #[arg(long, default_value = "banan_stats.duckdb")]
        db_path: PathBuf,
        /// Listen address; ":7070" binds all interfaces
        #[arg(long, default_value = ":7070")]
        listen: String,
    },
}
