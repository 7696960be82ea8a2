//! # Vault Server Binary
//!
//! Serves vault accounts from a data directory.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mnemo_vault::config::{self, Config};
use mnemo_vault::Server;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Mnemo vault server
#[derive(Parser)]
#[command(name = "mnemo-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Account directory, overrides the configuration
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Print a sample configuration and exit
    #[arg(long)]
    sample_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.sample_config {
        print!("{}", config::generate_sample());
        return Ok(());
    }

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install logging")?;

    let mut config = match &cli.config {
        Some(path) => config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    if let Some(data_dir) = cli.data_dir {
        config.server.data_dir = data_dir;
    }
    config.validate()?;

    let server = Server::bind(&config.server)
        .await
        .context("Failed to start server")?;
    println!("Listening on {}", server.local_addr());

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
