//! Message publishing to tenant queues.
//!
//! Publishes go through the default exchange with the queue name as routing
//! key. Every publish carries a bounded timeout so callers holding locks are
//! never wedged on a stalled broker.

use std::time::Duration;

use lapin::{options::BasicPublishOptions, types::FieldTable, BasicProperties, Channel};
use manifold_core::{CoreError, Result, TenantId};
use tracing::debug;

/// Upper bound on any single publish operation.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

const CONTENT_TYPE_JSON: &str = "application/json";

/// Publisher over a dedicated broker channel.
#[derive(Clone)]
pub struct Publisher {
    channel: Channel,
}

impl Publisher {
    /// Creates a publisher over the given channel.
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Publishes a JSON payload to the tenant's queue with the given headers.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Broker` on publish failure or timeout.
    pub async fn publish_to_tenant(
        &self,
        tenant_id: TenantId,
        payload: &[u8],
        headers: FieldTable,
    ) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE_JSON.into())
            .with_headers(headers);

        self.publish_raw(&tenant_id.queue_name(), payload, properties).await
    }

    /// Publishes a raw payload with caller-supplied properties.
    ///
    /// Used by the retry path, which must preserve the original delivery's
    /// body and content type byte for byte.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Broker` on publish failure or timeout.
    pub async fn publish_raw(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<()> {
        let publish = async {
            self.channel
                .basic_publish(
                    "",
                    routing_key,
                    BasicPublishOptions::default(),
                    payload,
                    properties,
                )
                .await
                .map_err(|e| CoreError::broker(format!("publish to {routing_key} failed: {e}")))?
                .await
                .map_err(|e| {
                    CoreError::broker(format!("publish confirmation for {routing_key} failed: {e}"))
                })?;
            Ok::<_, CoreError>(())
        };

        tokio::time::timeout(PUBLISH_TIMEOUT, publish)
            .await
            .map_err(|_| CoreError::broker(format!("publish to {routing_key} timed out")))??;

        debug!(routing_key, bytes = payload.len(), "message published");

        Ok(())
    }
}
