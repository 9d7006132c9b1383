//! Control-plane fan-out over a broker exchange.
//!
//! Tenant lifecycle commands are broadcast through the durable direct
//! exchange `tenant.control` with one routing key per operation. Every
//! worker process declares a server-named queue bound to all three keys and
//! mirrors the commands locally, so all replicas converge on the same
//! tenant set. Operations commute: create is idempotent on an existing
//! tenant, delete on an absent one, and update is last-writer-wins.

use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Consumer, ExchangeKind,
};
use manifold_core::{CoreError, Result, TenantId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::publish::PUBLISH_TIMEOUT;

/// Name of the control exchange.
pub const CONTROL_EXCHANGE: &str = "tenant.control";

/// Routing key for tenant creation events.
pub const RK_CREATE: &str = "tenant.create";
/// Routing key for concurrency update events.
pub const RK_UPDATE: &str = "tenant.update";
/// Routing key for tenant deletion events.
pub const RK_DELETE: &str = "tenant.delete";

/// Kind of control command, one per routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// A tenant was created somewhere in the fleet.
    Create,
    /// A tenant's worker count changed.
    Update,
    /// A tenant was deleted.
    Delete,
}

impl ControlKind {
    /// The routing key this kind is published under.
    pub fn routing_key(self) -> &'static str {
        match self {
            Self::Create => RK_CREATE,
            Self::Update => RK_UPDATE,
            Self::Delete => RK_DELETE,
        }
    }

    /// Parses a routing key back into a kind.
    pub fn from_routing_key(key: &str) -> Option<Self> {
        match key {
            RK_CREATE => Some(Self::Create),
            RK_UPDATE => Some(Self::Update),
            RK_DELETE => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Wire body of a control command.
///
/// `workers` is meaningful for create and update; ignored for delete.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ControlEvent {
    /// Tenant the command applies to.
    pub tenant_id: Uuid,
    /// Requested worker count.
    pub workers: i32,
}

impl ControlEvent {
    /// Builds a control event for a tenant.
    pub fn new(tenant_id: TenantId, workers: i32) -> Self {
        Self { tenant_id: tenant_id.0, workers }
    }

    /// Typed accessor for the tenant ID.
    pub fn tenant_id(&self) -> TenantId {
        TenantId(self.tenant_id)
    }
}

/// Declares the control exchange: direct, durable, non-auto-delete.
///
/// # Errors
///
/// Returns `CoreError::Broker` if the declaration fails.
pub async fn declare_control_exchange(channel: &Channel) -> Result<()> {
    channel
        .exchange_declare(
            CONTROL_EXCHANGE,
            ExchangeKind::Direct,
            ExchangeDeclareOptions { durable: true, ..ExchangeDeclareOptions::default() },
            FieldTable::default(),
        )
        .await
        .map_err(|e| CoreError::broker(format!("failed to declare control exchange: {e}")))?;

    Ok(())
}

/// Publishes tenant lifecycle commands to the control exchange.
#[derive(Clone)]
pub struct ControlPublisher {
    channel: Channel,
}

impl ControlPublisher {
    /// Creates a publisher, declaring the exchange first.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Broker` if the exchange cannot be declared.
    pub async fn new(channel: Channel) -> Result<Self> {
        declare_control_exchange(&channel).await?;
        Ok(Self { channel })
    }

    /// Broadcasts a control command to every subscribed worker process.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Broker` on publish failure or timeout.
    pub async fn publish(&self, kind: ControlKind, event: ControlEvent) -> Result<()> {
        let body = serde_json::to_vec(&event)
            .map_err(|e| CoreError::Validation(format!("control event serialization: {e}")))?;

        let publish = async {
            self.channel
                .basic_publish(
                    CONTROL_EXCHANGE,
                    kind.routing_key(),
                    BasicPublishOptions::default(),
                    &body,
                    lapin::BasicProperties::default().with_content_type("application/json".into()),
                )
                .await
                .map_err(|e| CoreError::broker(format!("control publish failed: {e}")))?
                .await
                .map_err(|e| CoreError::broker(format!("control publish confirm failed: {e}")))?;
            Ok::<_, CoreError>(())
        };

        tokio::time::timeout(PUBLISH_TIMEOUT, publish)
            .await
            .map_err(|_| CoreError::broker("control publish timed out".to_string()))??;

        debug!(routing_key = kind.routing_key(), tenant_id = %event.tenant_id, "control event published");

        Ok(())
    }
}

/// Binds this process to the control exchange and returns the delivery
/// stream.
///
/// Declares a server-named queue (durable flag, exclusive, auto-delete),
/// binds it to all three routing keys, and starts an auto-acknowledged
/// consumer. The queue disappears with the process.
///
/// # Errors
///
/// Returns `CoreError::Broker` if any declaration, bind, or consume fails.
pub async fn subscribe(channel: &Channel) -> Result<Consumer> {
    declare_control_exchange(channel).await?;

    let queue = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                durable: true,
                exclusive: true,
                auto_delete: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| CoreError::broker(format!("failed to declare control queue: {e}")))?;

    for routing_key in [RK_CREATE, RK_UPDATE, RK_DELETE] {
        channel
            .queue_bind(
                queue.name().as_str(),
                CONTROL_EXCHANGE,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                CoreError::broker(format!("failed to bind control queue to {routing_key}: {e}"))
            })?;
    }

    let consumer = channel
        .basic_consume(
            queue.name().as_str(),
            "",
            BasicConsumeOptions { no_ack: true, ..BasicConsumeOptions::default() },
            FieldTable::default(),
        )
        .await
        .map_err(|e| CoreError::broker(format!("failed to consume control queue: {e}")))?;

    info!(queue = %queue.name(), "subscribed to control exchange");

    Ok(consumer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_keys_round_trip() {
        for kind in [ControlKind::Create, ControlKind::Update, ControlKind::Delete] {
            assert_eq!(ControlKind::from_routing_key(kind.routing_key()), Some(kind));
        }
        assert_eq!(ControlKind::from_routing_key("tenant.rename"), None);
    }

    #[test]
    fn control_event_wire_shape() {
        let tenant_id = TenantId::new();
        let event = ControlEvent::new(tenant_id, 5);

        let json = serde_json::to_value(event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"tenant_id": tenant_id.0, "workers": 5})
        );

        let back: ControlEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.tenant_id(), tenant_id);
        assert_eq!(back.workers, 5);
    }

    #[test]
    fn malformed_control_body_is_an_error() {
        let result = serde_json::from_slice::<ControlEvent>(b"{\"tenant_id\": 42}");
        assert!(result.is_err());
    }
}
