//! Node daemon binary

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use revkv::client::Client;
use revkv::server::{Config, Server};
use revkv::transport;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "revkvd")]
#[command(about = "revkv cluster node", version = revkv::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until interrupted
    Serve {
        /// Node data directory
        #[arg(long, short)]
        dir: PathBuf,
    },

    /// Print the cluster roster
    Cluster {
        /// Node data directory (certificates and identity)
        #[arg(long, short)]
        dir: PathBuf,

        /// Node to query; defaults to this node's own address
        #[arg(long)]
        address: Option<String>,
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

    match cli.command {
        Commands::Serve { dir } => {
            let server = Server::new(&dir).await?;
            tokio::signal::ctrl_c().await?;
            tracing::info!("Interrupted, shutting down");
            server.close().await?;
        }

        Commands::Cluster { dir, address } => {
            let cert = Arc::new(transport::load_cert(&dir)?);
            let address = match address {
                Some(address) => address,
                None => {
                    let config = Config::load(&dir)?;
                    if config.address.is_empty() {
                        anyhow::bail!("node not initialized yet; pass --address");
                    }
                    config.address
                }
            };

            let client = Client::new(&address, cert);
            let servers = client.servers().await?;
            println!("{:<20} {:<24} {}", "ID", "ADDRESS", "ROLE");
            for server in servers {
                println!("{:<20x} {:<24} {}", server.id, server.address, server.role);
            }
        }
    }

    Ok(())
}
