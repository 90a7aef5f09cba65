//! Coordinator binary

use clap::Parser;
use geofs::{Config, Coordinator};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "geofs-coordinator")]
#[command(about = "geofs coordinator: metadata, placement, and repair loops")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "configs/geofs.toml")]
    config: PathBuf,
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

    let coordinator = Coordinator::bind(config).await?;
    coordinator.run().await?;
    Ok(())
}
