//! Broker connection management.
//!
//! One AMQP connection is shared across all tenants; each tenant's consumer
//! owns a dedicated channel on that connection, as does the control-plane
//! subscriber.

use lapin::{Channel, Connection, ConnectionProperties};
use manifold_core::{CoreError, Result};
use tracing::info;

/// Shared handle to the broker connection.
#[derive(Clone)]
pub struct Broker {
    connection: std::sync::Arc<Connection>,
}

impl Broker {
    /// Connects to the broker at the given AMQP URL.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Broker` if the connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| CoreError::broker(format!("failed to connect to broker: {e}")))?;

        info!("broker connection established");

        Ok(Self { connection: std::sync::Arc::new(connection) })
    }

    /// Opens a fresh channel on the shared connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Broker` if the channel cannot be opened.
    pub async fn create_channel(&self) -> Result<Channel> {
        self.connection
            .create_channel()
            .await
            .map_err(|e| CoreError::broker(format!("failed to open broker channel: {e}")))
    }

    /// Whether the underlying connection is still usable.
    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}
