//! Disk registry daemon.

use clap::Parser;
use disk_registry::store::RocksDurableStore;
use disk_registry::{AgentRecoveryScheduler, RegistryNode, RegistryNodeConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "registryd")]
#[command(about = "Storage-cluster metadata registry node")]
struct Args {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory
    #[arg(long, env = "REGISTRY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Start in read-only mode
    #[arg(long)]
    read_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = args.config {
        RegistryNodeConfig::from_file(&config_path)?
    } else {
        RegistryNodeConfig::default()
    };

    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if args.read_only {
        config.read_only = true;
    }
    config.validate()?;

    let store = Arc::new(RocksDurableStore::open(&config.data_dir)?);
    let node = RegistryNode::load(store)?;
    node.set_writable(!config.read_only);

    let scheduler = AgentRecoveryScheduler::new(Arc::clone(&node), config.recovery.clone());
    Arc::clone(&scheduler).start().await;

    info!(data_dir = %config.data_dir.display(), read_only = config.read_only, "registry node running");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    scheduler.stop();
    node.workers().shutdown().await;

    Ok(())
}
