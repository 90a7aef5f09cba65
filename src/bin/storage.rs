//! Storage server binary

use clap::Parser;
use geofs::common::Location;
use geofs::{Config, StorageServer};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "geofs-storage")]
#[command(about = "geofs storage server: chunk lifecycle and 2PC handlers")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "configs/geofs.toml")]
    config: PathBuf,

    /// Server id
    #[arg(long)]
    id: String,

    /// X coordinate of this server's location
    #[arg(long)]
    x: f64,

    /// Y coordinate of this server's location
    #[arg(long)]
    y: f64,

    /// Capacity in MiB (overrides the configured space_limit_mb)
    #[arg(long)]
    space: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;

    let server = StorageServer::bind(&config, cli.id, Location::new(cli.x, cli.y), cli.space).await?;
    server.run().await?;
    Ok(())
}
