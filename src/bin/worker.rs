//! Headless Manifold worker.
//!
//! Runs the tenant runtime without an HTTP surface: restores consumers for
//! every persisted tenant, then follows the control exchange so tenant
//! lifecycle mutations made through any API process are mirrored here.

use std::sync::Arc;

use anyhow::{Context, Result};
use manifold::{create_database_pool, init_tracing, run_migrations, shutdown_signal};
use manifold_api::Config;
use manifold_broker::Broker;
use manifold_consumer::{run_control_loop, DefaultHandler, TenantManager};
use manifold_core::{storage::Storage, RealClock};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info,manifold=debug");

    info!("Starting Manifold worker");

    let config = Config::load()?;
    info!(
        database_url = %config.database_url_masked(),
        amqp_url = %config.amqp_url_masked(),
        "Configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    run_migrations(&pool).await?;

    let broker = Broker::connect(&config.amqp_url())
        .await
        .context("Failed to connect to broker")?;

    let storage = Storage::new(pool.clone());
    let handler = Arc::new(DefaultHandler::new(storage.clone()));
    let clock = Arc::new(RealClock::new());

    let manager = Arc::new(
        TenantManager::new(storage, broker.clone(), handler, clock)
            .await
            .context("Failed to create tenant manager")?,
    );

    manager.bootstrap().await.context("Failed to bootstrap tenants")?;

    let control_stop = CancellationToken::new();
    let control_channel = broker.create_channel().await?;
    let control_consumer = manifold_broker::subscribe(&control_channel).await?;
    let control_handle = tokio::spawn(run_control_loop(
        manager.clone(),
        control_consumer,
        control_stop.clone(),
    ));

    info!("Manifold worker is ready");

    shutdown_signal().await;
    info!("Shutdown signal received, stopping consumers");

    manager.stop_all().await;

    control_stop.cancel();
    let _ = control_handle.await;

    pool.close().await;
    info!("Manifold worker shutdown complete");

    Ok(())
}
