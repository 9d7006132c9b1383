//! Shared startup plumbing for the Manifold binaries.
//!
//! Both the API server and the headless worker initialize tracing, connect
//! to Postgres with retry, apply the schema, and wire the broker-backed
//! tenant runtime. The binaries differ only in whether an HTTP server runs.

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, Result};
use manifold_api::Config;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// Initializes tracing with environment-based configuration.
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .expect("Invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry.
///
/// # Errors
///
/// Returns error once all connection attempts are exhausted or the
/// verification query fails.
pub async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.database_url())
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Applies the schema.
///
/// The `messages` table is list-partitioned by tenant; per-tenant
/// partitions are created at tenant-creation time inside the same
/// transaction as the tenant row.
///
/// # Errors
///
/// Returns error if any statement fails.
pub async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS tenants (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            max_workers INTEGER NOT NULL DEFAULT 3,
            current_workers INTEGER NOT NULL DEFAULT 3,
            queue_name TEXT NOT NULL UNIQUE,
            consumer_tag TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            deleted_at TIMESTAMPTZ,
            CHECK (current_workers >= 0)
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create tenants table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS messages (
            id UUID NOT NULL,
            tenant_id UUID NOT NULL,
            payload JSONB NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            scheduled_at TIMESTAMPTZ,
            processed_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (id, tenant_id)
        ) PARTITION BY LIST (tenant_id)
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create messages table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS tenant_configs (
            tenant_id UUID NOT NULL REFERENCES tenants(id),
            config_key TEXT NOT NULL,
            config_value JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (tenant_id, config_key)
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create tenant_configs table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS message_processing_logs (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            message_id UUID NOT NULL,
            tenant_id UUID NOT NULL,
            worker_id TEXT NOT NULL,
            status TEXT NOT NULL,
            error_message TEXT,
            processing_duration_ms BIGINT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create message_processing_logs table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS dead_letter_messages (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            original_message_id UUID NOT NULL,
            tenant_id UUID NOT NULL,
            payload JSONB NOT NULL,
            failure_reason TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create dead_letter_messages table")?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_messages_created
        ON messages (created_at, id)
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create messages pagination index")?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_processing_logs_message
        ON message_processing_logs (message_id, tenant_id, created_at)
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create processing log index")?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_dead_letters_tenant
        ON dead_letter_messages (tenant_id, created_at)
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create dead-letter index")?;

    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
