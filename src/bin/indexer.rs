use anyhow::{Context, Result};
use purchase_tracker::config::Config;
use purchase_tracker::coordinator::Coordinator;
use purchase_tracker::deployment::resolve_start_block;
use purchase_tracker::repository::{CheckpointStore, SqliteStore};
use purchase_tracker::rpc::RpcClient;
use purchase_tracker::subscriber::WsSubscriber;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting purchase tracker");

    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("Contract address: {:?}", config.contract_address);
    info!(
        "RPC URLs: {} endpoint(s) configured",
        config.json_rpc_urls.len()
    );

    let store = SqliteStore::open(&config.database_url)?.with_hash_retention(config.dedup_window);
    let checkpoint = store.load().context("Failed to read checkpoint")?;
    info!("Database initialized, checkpoint {}", checkpoint);

    let client = Arc::new(RpcClient::new(&config.json_rpc_urls, config.rpc_max_retries)?);
    info!("RPC client connected");

    let start_block = resolve_start_block(
        client.as_ref(),
        config.contract_address,
        config.start_block,
        checkpoint,
    )
    .await?;

    let subscriber = WsSubscriber::new(&config.ws_rpc_url);
    let mut coordinator = Coordinator::new(
        client,
        subscriber,
        store,
        config.contract_address,
        config.coordinator_settings(start_block),
    );

    let reader = coordinator.reader();
    tokio::select! {
        result = coordinator.run() => {
            if let Err(e) = result {
                error!("Ingestion stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down at checkpoint {}", reader.checkpoint());
        }
    }

    Ok(())
}
