//! Manifold API server.
//!
//! Runs the HTTP surface together with a full tenant runtime: consumers for
//! every persisted tenant, a control-plane subscription mirroring fleet
//! mutations, and graceful shutdown that drains in-flight deliveries before
//! the HTTP server stops.

use std::sync::Arc;

use anyhow::{Context, Result};
use manifold::{create_database_pool, init_tracing, run_migrations, shutdown_signal};
use manifold_api::{AppState, Config};
use manifold_broker::{Broker, ControlPublisher, Publisher};
use manifold_consumer::{run_control_loop, DefaultHandler, TenantManager};
use manifold_core::{storage::Storage, RealClock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info,manifold=debug,tower_http=debug");

    info!("Starting Manifold API server");

    let config = Arc::new(Config::load()?);
    info!(
        database_url = %config.database_url_masked(),
        amqp_url = %config.amqp_url_masked(),
        "Configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    run_migrations(&pool).await?;
    info!("Database migrations completed");

    let broker = Broker::connect(&config.amqp_url())
        .await
        .context("Failed to connect to broker")?;

    let storage = Storage::new(pool.clone());
    let handler = Arc::new(DefaultHandler::new(storage.clone()));
    let clock = Arc::new(RealClock::new());

    let manager = Arc::new(
        TenantManager::new(storage.clone(), broker.clone(), handler, clock)
            .await
            .context("Failed to create tenant manager")?,
    );

    manager.bootstrap().await.context("Failed to bootstrap tenants")?;

    // Mirror tenant lifecycle events from the rest of the fleet, including
    // our own broadcasts, which the manager applies idempotently.
    let control_stop = CancellationToken::new();
    let control_channel = broker.create_channel().await?;
    let control_consumer = manifold_broker::subscribe(&control_channel).await?;
    let control_handle = tokio::spawn(run_control_loop(
        manager.clone(),
        control_consumer,
        control_stop.clone(),
    ));

    let publisher = Publisher::new(broker.create_channel().await?);
    let control = ControlPublisher::new(broker.create_channel().await?).await?;
    let state = AppState::new(storage, manager.clone(), publisher, control, config.clone());

    let addr = config.parse_server_addr()?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = manifold_api::start_server(state, addr).await {
            error!(error = %e, "Server failed");
        }
    });

    info!(%addr, "Manifold is ready");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    manager.stop_all().await;

    control_stop.cancel();
    let _ = control_handle.await;

    let _ = server_handle.await;
    info!("HTTP server stopped");

    pool.close().await;
    info!("Manifold shutdown complete");

    Ok(())
}
