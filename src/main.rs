use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cosmos_indexer::config::Settings;
use cosmos_indexer::cosmos::CosmosChain;
use cosmos_indexer::db::Store;
use cosmos_indexer::indexer::{Backfiller, LiveTailer, Persister};
use cosmos_indexer::metrics::{setup_metrics_recorder, Metrics};
use cosmos_indexer::storage::{BlobSink, S3Store};

#[derive(Parser)]
struct Args {
    /// Drop and re-create the schema before starting
    #[arg(long)]
    reset: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::new().unwrap_or_else(|e| {
        error!("failed to load configuration: {e:?}");
        std::process::exit(1);
    });
    info!(chain_id = %settings.chain.chain_id, "loaded settings");

    setup_metrics_recorder(&settings.metrics_addr)?;
    info!(addr = %settings.metrics_addr, "prometheus exporter listening");

    let store = Store::connect(&settings.database).await?;
    sqlx::query("SELECT 1")
        .execute(store.pool())
        .await
        .context("database health check failed")?;
    if args.reset {
        store.drop_tables().await?;
        info!(schema = %settings.database.schema_name, "schema reset");
    }
    store.create_tables().await?;
    info!(schema = %settings.database.schema_name, "database ready");

    let chain = Arc::new(CosmosChain::new(settings.chain.clone()));
    match chain.get_latest_height().await {
        Some(tip) => info!(tip, chain_id = %chain.chain_id(), "connected to upstream API"),
        None => {
            error!(chain_id = %chain.chain_id(), "no upstream API endpoint is reachable");
            std::process::exit(1);
        }
    }

    let metrics = Metrics::new();
    let blobs = BlobSink::new(Arc::new(S3Store::new(&settings.storage)?), metrics);
    let persister = Arc::new(Persister::new(
        store,
        blobs,
        chain.registry_name().to_owned(),
        metrics,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let live = LiveTailer::new(
        Arc::clone(&chain),
        Arc::clone(&persister),
        shutdown_rx.clone(),
        metrics,
    );
    let backfiller = Backfiller::new(chain, persister, shutdown_rx);

    let live_handle = tokio::spawn(live.run());
    let historical_handle = tokio::spawn(backfiller.clone().run_historical());
    let repair_handle = tokio::spawn(backfiller.run_wrong_count());

    let (live_res, historical_res, repair_res) =
        tokio::try_join!(live_handle, historical_handle, repair_handle)?;
    live_res?;
    historical_res?;
    repair_res?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
