//! Core domain models and strongly-typed identifiers.
//!
//! Defines tenants, messages, processing logs, dead letters, and newtype ID
//! wrappers for compile-time type safety. Includes database serialization
//! traits and the status enums driving the dispatch pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed tenant identifier.
///
/// Wraps a UUID to prevent mixing with message IDs. Every queue, partition,
/// and worker pool is scoped to exactly one tenant ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub Uuid);

impl TenantId {
    /// Creates a new random tenant ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Queue name owned by this tenant, stable for the tenant's lifetime.
    pub fn queue_name(&self) -> String {
        format!("tenant_{}_queue", self.0)
    }

    /// Partition name for this tenant's slice of the messages table.
    pub fn partition_name(&self) -> String {
        format!("messages_tenant_{}", self.0.simple())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TenantId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for TenantId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for TenantId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for TenantId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed message identifier.
///
/// Messages are keyed `(id, tenant_id)`; the ID alone is not globally unique
/// across tenants at the storage layer, though v4 generation makes collisions
/// improbable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Creates a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for MessageId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for MessageId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for MessageId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Tenant lifecycle status.
///
/// `Active` tenants have a running consumer; `Stopped` is set on soft delete
/// together with `deleted_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    /// Consumer running, messages accepted.
    Active,
    /// Soft-deleted; consumer stopped, queue removed.
    Stopped,
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

impl sqlx::Type<PgDb> for TenantStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for TenantStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "active" => Ok(Self::Active),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("invalid tenant status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for TenantStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Tenant represents an isolated message stream with its own queue,
/// partition, and worker pool.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tenant {
    /// Unique identifier for this tenant.
    pub id: TenantId,

    /// Human-readable name.
    pub name: String,

    /// Lifecycle status.
    pub status: TenantStatus,

    /// Upper bound on the worker pool size.
    pub max_workers: i32,

    /// Most recently requested worker count.
    pub current_workers: i32,

    /// Broker queue owned by this tenant (`tenant_<uuid>_queue`).
    pub queue_name: String,

    /// Consumer tag used when subscribing to the queue.
    pub consumer_tag: String,

    /// When this tenant was created.
    pub created_at: DateTime<Utc>,

    /// When this tenant was last updated.
    pub updated_at: DateTime<Utc>,

    /// Soft-delete timestamp. A tenant with this set is considered absent
    /// and must not have a running consumer.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Tenant {
    /// Builds a fresh active tenant with a newly allocated ID.
    pub fn new(name: String, max_workers: i32) -> Self {
        Self::with_id(TenantId::new(), name, max_workers)
    }

    /// Builds an active tenant under a caller-supplied ID. Used when a
    /// control-plane create event arrives for a tenant this process has
    /// never seen.
    pub fn with_id(id: TenantId, name: String, max_workers: i32) -> Self {
        let now = Utc::now();
        Self {
            queue_name: id.queue_name(),
            consumer_tag: format!("consumer_{}", id.0),
            id,
            name,
            status: TenantStatus::Active,
            max_workers,
            current_workers: max_workers,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// Message lifecycle status.
///
/// ```text
/// Pending -> Processing -> Completed
///                       -> Failed (after retries exhaust)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Persisted and queued, not yet claimed by a worker.
    Pending,
    /// A worker is running the handler for this message.
    Processing,
    /// Handler succeeded; terminal.
    Completed,
    /// Retries exhausted; terminal. A dead-letter row exists.
    Failed,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl sqlx::Type<PgDb> for MessageStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for MessageStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid message status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for MessageStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// A message addressed to a tenant.
///
/// Rows live in the list-partitioned `messages` table; each tenant has its
/// own partition created at tenant-creation time.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    /// Unique identifier within the owning tenant.
    pub id: MessageId,

    /// Tenant that owns this message.
    pub tenant_id: TenantId,

    /// Opaque structured payload.
    pub payload: serde_json::Value,

    /// Current processing status.
    pub status: MessageStatus,

    /// Failed attempts so far.
    pub retry_count: i32,

    /// Attempt ceiling before dead-lettering.
    pub max_retries: i32,

    /// Optional future delivery time.
    pub scheduled_at: Option<DateTime<Utc>>,

    /// When the handler last finished with this message.
    pub processed_at: Option<DateTime<Utc>>,

    /// When the message was accepted.
    pub created_at: DateTime<Utc>,
}

/// Status values recorded in the processing audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    /// Worker picked up the delivery.
    Started,
    /// Handler returned success.
    Completed,
    /// Handler returned an error.
    Failed,
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl sqlx::Type<PgDb> for ProcessingStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ProcessingStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid processing status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for ProcessingStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Append-only audit record of one handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcessingLog {
    /// Message the invocation was for.
    pub message_id: MessageId,

    /// Tenant owning the message.
    pub tenant_id: TenantId,

    /// Process-local worker identifier.
    pub worker_id: String,

    /// Invocation outcome.
    pub status: ProcessingStatus,

    /// Handler error, when `status` is `failed`.
    pub error_message: Option<String>,

    /// Wall-clock handler duration, absent for `started` entries.
    pub processing_duration_ms: Option<i64>,

    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

/// Key/value configuration attached to a tenant.
///
/// The `concurrency` key carries `{"workers": N}` and is authoritative for
/// the worker count after an update.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TenantConfig {
    /// Tenant this configuration belongs to.
    pub tenant_id: TenantId,

    /// Configuration key, e.g. `concurrency`.
    pub config_key: String,

    /// Structured configuration value.
    pub config_value: serde_json::Value,

    /// When the value was last written.
    pub updated_at: DateTime<Utc>,
}

/// Config key carrying the worker-count setting.
pub const CONCURRENCY_CONFIG_KEY: &str = "concurrency";

/// Body of the `concurrency` configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Requested worker-pool size.
    pub workers: i32,
}

/// Terminally-failed message parked for inspection.
///
/// Rows are never re-consumed automatically.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeadLetterMessage {
    /// ID of the message whose retries were exhausted.
    pub original_message_id: MessageId,

    /// Tenant owning the message.
    pub tenant_id: TenantId,

    /// Payload at the time of the final failure.
    pub payload: serde_json::Value,

    /// Why the message was parked.
    pub failure_reason: String,

    /// Retry count at the time of parking.
    pub retry_count: i32,

    /// Final handler error.
    pub last_error: Option<String>,

    /// When the row was written.
    pub created_at: DateTime<Utc>,
}

/// Reason recorded when retries run out.
pub const MAX_RETRIES_EXCEEDED: &str = "Max retries exceeded";

/// Default worker count applied when a request omits one or a persisted
/// value is unusable.
pub const DEFAULT_WORKER_COUNT: i32 = 3;

/// Default retry ceiling before dead-lettering.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_queue_name_is_stable() {
        let id = TenantId::new();
        assert_eq!(id.queue_name(), format!("tenant_{}_queue", id.0));
        assert_eq!(id.queue_name(), id.queue_name());
    }

    #[test]
    fn partition_name_strips_hyphens() {
        let id = TenantId(Uuid::nil());
        assert_eq!(
            id.partition_name(),
            "messages_tenant_00000000000000000000000000000000"
        );
    }

    #[test]
    fn new_tenant_starts_active_with_full_pool() {
        let tenant = Tenant::new("acme".to_string(), 5);
        assert_eq!(tenant.status, TenantStatus::Active);
        assert_eq!(tenant.current_workers, 5);
        assert_eq!(tenant.max_workers, 5);
        assert!(tenant.deleted_at.is_none());
        assert_eq!(tenant.queue_name, tenant.id.queue_name());
    }

    #[test]
    fn status_display_matches_storage_format() {
        assert_eq!(MessageStatus::Pending.to_string(), "pending");
        assert_eq!(MessageStatus::Processing.to_string(), "processing");
        assert_eq!(MessageStatus::Completed.to_string(), "completed");
        assert_eq!(MessageStatus::Failed.to_string(), "failed");
        assert_eq!(ProcessingStatus::Started.to_string(), "started");
        assert_eq!(TenantStatus::Stopped.to_string(), "stopped");
    }

    #[test]
    fn concurrency_config_round_trips_json() {
        let config = ConcurrencyConfig { workers: 7 };
        let value = serde_json::to_value(config).unwrap();
        assert_eq!(value, serde_json::json!({"workers": 7}));
        let back: ConcurrencyConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back, config);
    }
}
