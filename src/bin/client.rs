//! Client binary

use clap::{Parser, Subcommand};
use geofs::common::Location;
use geofs::{Client, Config};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "geofs")]
#[command(about = "geofs client: upload, download, and append files")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "configs/geofs.toml")]
    config: PathBuf,

    /// Client id
    #[arg(long)]
    id: String,

    /// X coordinate of this client's location
    #[arg(long, default_value = "0.0")]
    x: f64,

    /// Y coordinate of this client's location
    #[arg(long, default_value = "0.0")]
    y: f64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local file
    Upload {
        local_path: PathBuf,
        remote_path: String,
    },
    /// Download a remote file
    Download {
        remote_path: String,
        local_path: PathBuf,
    },
    /// Append the contents of a local file to a remote file
    Append {
        remote_path: String,
        local_path: PathBuf,
    },
    /// List remote files
    Ls {
        /// Only list paths under this prefix
        #[arg(long)]
        prefix: Option<String>,
    },
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
    let client = Client::connect(&config, cli.id, Location::new(cli.x, cli.y)).await?;

    match cli.command {
        Commands::Upload {
            local_path,
            remote_path,
        } => {
            client.upload(&local_path, &remote_path).await?;
            println!("uploaded {} -> {}", local_path.display(), remote_path);
        }
        Commands::Download {
            remote_path,
            local_path,
        } => {
            client.download(&remote_path, &local_path).await?;
            println!("downloaded {} -> {}", remote_path, local_path.display());
        }
        Commands::Append {
            remote_path,
            local_path,
        } => {
            let data = std::fs::read(&local_path)?;
            client.append(&remote_path, &data).await?;
            println!("appended {} bytes to {}", data.len(), remote_path);
        }
        Commands::Ls { prefix } => {
            for path in client.list_files(prefix.as_deref()).await? {
                println!("{}", path);
            }
        }
    }

    Ok(())
}
