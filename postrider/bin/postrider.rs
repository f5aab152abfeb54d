//! postrider master binary

use std::sync::Arc;

use clap::{Parser, Subcommand};
use postrider::{Config, Master};
use postrider_common::Signal;
use postrider_queue::{MemoryQueueStore, Queue, QueueStore};
use postrider_spool::{BlobStore, FileBlobStore};
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "postrider", about = "Outbound mail relay", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the master: queue core, control plane, maintenance
    Master {
        /// Path to the TOML configuration
        #[arg(short, long, default_value = "/etc/postrider/postrider.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Master { config } => run_master(&config).await,
    }
}

async fn run_master(config_path: &str) -> anyhow::Result<()> {
    let config = Config::load(config_path).await?;
    info!(instance = %config.instance, "Configuration loaded");

    let blobs: Arc<dyn BlobStore> = Arc::new(FileBlobStore::open(&config.spool_dir).await?);
    let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
    let zones = Arc::new(config.zone_registry());

    let mut queue = Queue::new(store, blobs, zones, config.queue_config())
        .with_domains(config.domain_registry());
    if let Some(metrics) = postrider::master::init_metrics() {
        queue = queue.with_metrics(metrics);
    }

    for seed in &config.suppression {
        match (&seed.address, &seed.domain) {
            (Some(address), _) => {
                queue.suppression().add_address(address);
            }
            (None, Some(domain)) => {
                queue.suppression().add_domain(domain);
            }
            (None, None) => {}
        }
    }

    let master = Master::new(Arc::new(queue), config.maintenance_config());

    let (shutdown_tx, _) = broadcast::channel(4);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = signal_tx.send(Signal::Shutdown);
        }
    });

    master.serve(config.control_addr, &shutdown_tx).await
}
