//! Pluggable business-logic handler and the default implementation.
//!
//! The dispatch contract: a handler receives `(tenant_id, message_id,
//! payload)` and returns success or a classified error. Transient errors go
//! through the retry schedule; terminal errors dead-letter immediately.

use std::time::Duration;

use async_trait::async_trait;
use manifold_core::{storage::Storage, MessageId, TenantId};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Handler failure classification.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// Retryable failure; goes through the backoff schedule.
    #[error("transient handler failure: {0}")]
    Transient(String),

    /// Non-retryable failure, equivalent to exhausted retries.
    #[error("terminal handler failure: {0}")]
    Terminal(String),
}

/// Business-logic handler invoked once per delivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one message payload.
    async fn handle(
        &self,
        tenant_id: TenantId,
        message_id: MessageId,
        payload: &[u8],
    ) -> Result<(), HandlerError>;
}

/// Message classification derived from the payload's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `type: "email"`
    Email,
    /// `type: "webhook"`
    Webhook,
    /// `type: "notification"`
    Notification,
    /// Any other or missing type.
    Generic,
}

impl MessageKind {
    /// Classifies a parsed payload by its `type` field.
    pub fn from_payload(payload: &Value) -> Self {
        match payload.get("type").and_then(Value::as_str) {
            Some("email") => Self::Email,
            Some("webhook") => Self::Webhook,
            Some("notification") => Self::Notification,
            _ => Self::Generic,
        }
    }
}

/// Default handler: records the message as `processing`, then dispatches on
/// the payload type. The type-specific branches are stubs for integrators
/// to replace.
pub struct DefaultHandler {
    storage: Storage,
}

impl DefaultHandler {
    /// Creates the default handler over the shared storage.
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    async fn process_email(&self, _tenant_id: TenantId, _data: &Value) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn process_webhook(
        &self,
        _tenant_id: TenantId,
        _data: &Value,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn process_notification(
        &self,
        _tenant_id: TenantId,
        _data: &Value,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn process_generic(
        &self,
        _tenant_id: TenantId,
        _data: &Value,
    ) -> Result<(), HandlerError> {
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for DefaultHandler {
    async fn handle(
        &self,
        tenant_id: TenantId,
        message_id: MessageId,
        payload: &[u8],
    ) -> Result<(), HandlerError> {
        let parsed: Value = serde_json::from_slice(payload)
            .map_err(|e| HandlerError::Terminal(format!("failed to parse message payload: {e}")))?;

        // Database errors during processing count as transient.
        self.storage
            .messages
            .upsert_processing(message_id, tenant_id, &parsed)
            .await
            .map_err(|e| HandlerError::Transient(format!("failed to store message: {e}")))?;

        // Placeholder for real work.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let kind = MessageKind::from_payload(&parsed);
        debug!(%tenant_id, %message_id, ?kind, "dispatching message");

        match kind {
            MessageKind::Email => self.process_email(tenant_id, &parsed).await,
            MessageKind::Webhook => self.process_webhook(tenant_id, &parsed).await,
            MessageKind::Notification => self.process_notification(tenant_id, &parsed).await,
            MessageKind::Generic => self.process_generic(tenant_id, &parsed).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn payload_type_classification() {
        assert_eq!(
            MessageKind::from_payload(&json!({"type": "email", "data": {}})),
            MessageKind::Email
        );
        assert_eq!(
            MessageKind::from_payload(&json!({"type": "webhook"})),
            MessageKind::Webhook
        );
        assert_eq!(
            MessageKind::from_payload(&json!({"type": "notification"})),
            MessageKind::Notification
        );
        assert_eq!(MessageKind::from_payload(&json!({"type": "sms"})), MessageKind::Generic);
        assert_eq!(MessageKind::from_payload(&json!({"data": 1})), MessageKind::Generic);
        assert_eq!(MessageKind::from_payload(&json!(42)), MessageKind::Generic);
    }

    #[test]
    fn handler_error_display() {
        assert_eq!(
            HandlerError::Transient("db down".into()).to_string(),
            "transient handler failure: db down"
        );
        assert_eq!(
            HandlerError::Terminal("bad payload".into()).to_string(),
            "terminal handler failure: bad payload"
        );
    }
}
