//! AMQP header table construction and typed access.
//!
//! Work deliveries carry `message_id`, `tenant_id`, `priority`, `created_at`
//! and optionally `scheduled_at`; republished attempts add `retry_count` and
//! `retry_timestamp`. Header values arrive as loosely-typed AMQP variants,
//! so reads tolerate the integer widths different producers emit.

use chrono::{DateTime, Utc};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use manifold_core::{MessageId, TenantId};

/// Header key carrying the message UUID.
pub const MESSAGE_ID: &str = "message_id";
/// Header key carrying the owning tenant UUID.
pub const TENANT_ID: &str = "tenant_id";
/// Header key carrying the producer-supplied priority.
pub const PRIORITY: &str = "priority";
/// Header key carrying the producer timestamp (seconds).
pub const CREATED_AT: &str = "created_at";
/// Header key carrying the optional future delivery time (seconds).
pub const SCHEDULED_AT: &str = "scheduled_at";
/// Header key present on republished attempts only.
pub const RETRY_COUNT: &str = "retry_count";
/// Header key stamping when a republish was scheduled.
pub const RETRY_TIMESTAMP: &str = "retry_timestamp";

/// Builds the header table for a fresh work delivery.
pub fn work_headers(
    message_id: MessageId,
    tenant_id: TenantId,
    priority: i32,
    created_at: DateTime<Utc>,
    scheduled_at: Option<DateTime<Utc>>,
) -> FieldTable {
    let mut table = FieldTable::default();
    table.insert(
        ShortString::from(MESSAGE_ID),
        AMQPValue::LongString(message_id.to_string().into()),
    );
    table.insert(
        ShortString::from(TENANT_ID),
        AMQPValue::LongString(tenant_id.to_string().into()),
    );
    table.insert(ShortString::from(PRIORITY), AMQPValue::LongInt(priority));
    table.insert(
        ShortString::from(CREATED_AT),
        AMQPValue::LongLongInt(created_at.timestamp()),
    );
    if let Some(at) = scheduled_at {
        table.insert(
            ShortString::from(SCHEDULED_AT),
            AMQPValue::LongLongInt(at.timestamp()),
        );
    }
    table
}

/// Reads a string-valued header.
pub fn get_str(headers: Option<&FieldTable>, key: &str) -> Option<String> {
    match headers?.inner().get(key)? {
        AMQPValue::LongString(s) => Some(s.to_string()),
        AMQPValue::ShortString(s) => Some(s.to_string()),
        _ => None,
    }
}

/// Reads an integer-valued header regardless of the AMQP integer width the
/// producer used.
pub fn get_int(headers: Option<&FieldTable>, key: &str) -> Option<i64> {
    match headers?.inner().get(key)? {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}

/// Copies `headers` and stamps the retry metadata for a republished attempt.
pub fn with_retry(
    headers: Option<&FieldTable>,
    retry_count: i32,
    now: DateTime<Utc>,
) -> FieldTable {
    let mut table = headers.cloned().unwrap_or_default();
    table.insert(ShortString::from(RETRY_COUNT), AMQPValue::LongInt(retry_count));
    table.insert(
        ShortString::from(RETRY_TIMESTAMP),
        AMQPValue::LongLongInt(now.timestamp()),
    );
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_headers_carry_identity_and_timestamps() {
        let message_id = MessageId::new();
        let tenant_id = TenantId::new();
        let now = Utc::now();

        let table = work_headers(message_id, tenant_id, 2, now, None);

        assert_eq!(get_str(Some(&table), MESSAGE_ID), Some(message_id.to_string()));
        assert_eq!(get_str(Some(&table), TENANT_ID), Some(tenant_id.to_string()));
        assert_eq!(get_int(Some(&table), PRIORITY), Some(2));
        assert_eq!(get_int(Some(&table), CREATED_AT), Some(now.timestamp()));
        assert_eq!(get_int(Some(&table), SCHEDULED_AT), None);
    }

    #[test]
    fn scheduled_at_present_only_when_set() {
        let now = Utc::now();
        let later = now + chrono::Duration::hours(1);

        let table = work_headers(MessageId::new(), TenantId::new(), 0, now, Some(later));
        assert_eq!(get_int(Some(&table), SCHEDULED_AT), Some(later.timestamp()));
    }

    #[test]
    fn with_retry_increments_over_missing_headers() {
        let now = Utc::now();
        let table = with_retry(None, 1, now);

        assert_eq!(get_int(Some(&table), RETRY_COUNT), Some(1));
        assert_eq!(get_int(Some(&table), RETRY_TIMESTAMP), Some(now.timestamp()));
    }

    #[test]
    fn with_retry_preserves_existing_headers() {
        let message_id = MessageId::new();
        let now = Utc::now();
        let original = work_headers(message_id, TenantId::new(), 5, now, None);

        let retried = with_retry(Some(&original), 2, now);

        assert_eq!(get_str(Some(&retried), MESSAGE_ID), Some(message_id.to_string()));
        assert_eq!(get_int(Some(&retried), PRIORITY), Some(5));
        assert_eq!(get_int(Some(&retried), RETRY_COUNT), Some(2));
    }

    #[test]
    fn get_int_tolerates_narrow_widths() {
        let mut table = FieldTable::default();
        table.insert(ShortString::from("narrow"), AMQPValue::ShortInt(7));
        assert_eq!(get_int(Some(&table), "narrow"), Some(7));
        assert_eq!(get_int(Some(&table), "absent"), None);
        assert_eq!(get_int(None, "narrow"), None);
    }
}
