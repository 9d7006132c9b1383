//! Message publishing and cursor-paginated listing.
//!
//! Publishing persists the message row first, then enqueues the JSON
//! envelope on the tenant's queue with identity and timing headers. The
//! list endpoint paginates on `(created_at, id)` behind an opaque cursor,
//! so concurrent inserts never shift or duplicate pages.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use manifold_broker::headers;
use manifold_core::{storage::messages::PagePosition, Message, MessageId, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;
use uuid::Uuid;

use super::ApiError;
use crate::AppState;

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

/// Request body for publishing a message to a tenant.
#[derive(Debug, Deserialize)]
pub struct PublishMessageRequest {
    /// Message type driving handler dispatch (email, webhook, ...).
    #[serde(rename = "type")]
    pub message_type: String,
    /// Arbitrary structured payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Producer-supplied priority, observational only.
    #[serde(default)]
    pub priority: i32,
    /// Optional future delivery time.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Query parameters for the message listing.
#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    /// Opaque cursor returned by a previous page.
    pub cursor: Option<String>,
    /// Page size, clamped to 1..=100 (default 20).
    pub limit: Option<i64>,
}

/// Response body for a message listing page.
#[derive(Debug, Serialize)]
pub struct ListMessagesResponse {
    /// Messages on this page.
    pub data: Vec<Message>,
    /// Cursor for the next page, absent on the last page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Accepts a message for a tenant and enqueues it for dispatch.
#[instrument(name = "publish_message", skip(state, request), fields(message_type = %request.message_type))]
pub async fn publish_message(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(request): Json<PublishMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant_id = TenantId(tenant_id);
    let message_id = MessageId::new();
    let now = Utc::now();

    let envelope = json!({
        "id": message_id,
        "tenant_id": tenant_id,
        "type": request.message_type,
        "data": request.data,
        "created_at": now,
        "scheduled_at": request.scheduled_at,
    });

    state
        .storage
        .messages
        .insert(message_id, tenant_id, &envelope, request.scheduled_at)
        .await?;

    // Only stamp scheduled_at on the wire when it is actually in the future.
    let scheduled = request.scheduled_at.filter(|at| *at > now);
    let table = headers::work_headers(message_id, tenant_id, request.priority, now, scheduled);

    let payload = serde_json::to_vec(&envelope)
        .map_err(|e| manifold_core::CoreError::Validation(e.to_string()))?;

    state.publisher.publish_to_tenant(tenant_id, &payload, table).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message_id": message_id,
            "status": "queued",
            "tenant_id": tenant_id,
        })),
    ))
}

/// Lists messages with cursor pagination.
#[instrument(name = "list_messages", skip(state, query))]
pub async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<ListMessagesResponse>, ApiError> {
    let limit = match query.limit {
        Some(limit) if limit > 0 && limit <= MAX_PAGE_SIZE => limit,
        _ => DEFAULT_PAGE_SIZE,
    };

    let after = query.cursor.as_deref().and_then(decode_cursor);

    let mut data = state.storage.messages.list_page(after, limit).await?;

    let next_cursor = if data.len() > usize::try_from(limit).unwrap_or(usize::MAX) {
        data.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        data.last().map(encode_cursor)
    } else {
        None
    };

    Ok(Json(ListMessagesResponse { data, next_cursor }))
}

/// Encodes a keyset position as an opaque cursor.
fn encode_cursor(message: &Message) -> String {
    let raw = format!("{}:{}", message.created_at.timestamp_micros(), message.id);
    URL_SAFE_NO_PAD.encode(raw)
}

/// Decodes an opaque cursor back into a keyset position.
///
/// Invalid cursors are treated as absent, restarting from the first page.
fn decode_cursor(cursor: &str) -> Option<PagePosition> {
    let raw = URL_SAFE_NO_PAD.decode(cursor).ok()?;
    let raw = String::from_utf8(raw).ok()?;
    let (micros, id) = raw.split_once(':')?;

    let created_at = DateTime::from_timestamp_micros(micros.parse().ok()?)?;
    let id = MessageId(Uuid::parse_str(id).ok()?);

    Some(PagePosition { created_at, id })
}

#[cfg(test)]
mod tests {
    use manifold_core::MessageStatus;

    use super::*;

    fn sample_message() -> Message {
        Message {
            id: MessageId::new(),
            tenant_id: TenantId::new(),
            payload: json!({"type": "email"}),
            status: MessageStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            scheduled_at: None,
            processed_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn cursor_round_trips() {
        let message = sample_message();
        let cursor = encode_cursor(&message);

        let position = decode_cursor(&cursor).expect("cursor should decode");
        assert_eq!(position.id, message.id);
        assert_eq!(
            position.created_at.timestamp_micros(),
            message.created_at.timestamp_micros()
        );
    }

    #[test]
    fn cursor_is_opaque_url_safe() {
        let cursor = encode_cursor(&sample_message());
        assert!(!cursor.contains(':'));
        assert!(!cursor.contains('/'));
        assert!(!cursor.contains('+'));
    }

    #[test]
    fn invalid_cursors_restart_from_first_page() {
        assert!(decode_cursor("not-base64!").is_none());
        assert!(decode_cursor(&URL_SAFE_NO_PAD.encode("missing-separator")).is_none());
        assert!(decode_cursor(&URL_SAFE_NO_PAD.encode("12345:not-a-uuid")).is_none());
    }
}
