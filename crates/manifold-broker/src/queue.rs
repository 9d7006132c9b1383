//! Tenant queue declaration and deletion.
//!
//! Each tenant owns one durable queue named `tenant_<uuid>_queue`, routed
//! through the default exchange with the queue name as routing key.

use lapin::{
    options::{QueueDeclareOptions, QueueDeleteOptions},
    types::FieldTable,
    Channel,
};
use manifold_core::{CoreError, Result, TenantId};
use tracing::debug;

/// Declares the tenant's queue: durable, non-exclusive, non-auto-delete.
///
/// Declaration is idempotent; re-declaring an existing queue with the same
/// arguments is a no-op on the broker.
///
/// # Errors
///
/// Returns `CoreError::Broker` if the declaration fails.
pub async fn declare_tenant_queue(channel: &Channel, tenant_id: TenantId) -> Result<()> {
    let queue_name = tenant_id.queue_name();

    channel
        .queue_declare(
            &queue_name,
            QueueDeclareOptions { durable: true, ..QueueDeclareOptions::default() },
            FieldTable::default(),
        )
        .await
        .map_err(|e| CoreError::broker(format!("failed to declare queue {queue_name}: {e}")))?;

    debug!(%tenant_id, queue = %queue_name, "tenant queue declared");

    Ok(())
}

/// Deletes the tenant's queue.
///
/// # Errors
///
/// Returns `CoreError::Broker` if the deletion fails.
pub async fn delete_tenant_queue(channel: &Channel, tenant_id: TenantId) -> Result<()> {
    let queue_name = tenant_id.queue_name();

    channel
        .queue_delete(&queue_name, QueueDeleteOptions::default())
        .await
        .map_err(|e| CoreError::broker(format!("failed to delete queue {queue_name}: {e}")))?;

    debug!(%tenant_id, queue = %queue_name, "tenant queue deleted");

    Ok(())
}
