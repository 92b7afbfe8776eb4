//! CallFS - Distributed REST Filesystem
//!
//! Main entry point for the CallFS server.
//!
//! This binary wires together:
//! - The metadata store (memory, relational, embedded or replicated log)
//! - Storage backends (local filesystem, object store, peer proxy)
//! - The per-path lock manager (local or Redis)
//! - The metadata cache, link manager and background reapers
//! - The HTTP API surface

use std::path::PathBuf;

use clap::Parser;

use callfs::config::Config;
use callfs::server::Server;

/// CallFS server command line
#[derive(Debug, Parser)]
#[command(name = "callfs", version, about = "Distributed REST filesystem server")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "callfs.toml")]
    config: PathBuf,

    /// Override the configured listen address
    #[arg(long)]
    listen_addr: Option<String>,

    /// Log filter when RUST_LOG is unset (e.g. info, callfs=debug)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_tracing(default_level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let mut config = Config::load(&cli.config)?;
    if let Some(listen_addr) = cli.listen_addr {
        config.server.listen_addr = listen_addr;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "starting callfs"
    );

    Server::new(config).run().await
}
