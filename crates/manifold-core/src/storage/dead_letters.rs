//! Repository for the dead-letter table.
//!
//! Terminal store: rows are written once when retries exhaust and never
//! re-consumed automatically.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{DeadLetterMessage, MessageId, TenantId},
};

/// Repository for dead-letter operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Parks a terminally-failed message.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert(
        &self,
        message_id: MessageId,
        tenant_id: TenantId,
        payload: &serde_json::Value,
        failure_reason: &str,
        retry_count: i32,
        last_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO dead_letter_messages
                (original_message_id, tenant_id, payload, failure_reason, retry_count, last_error)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(message_id)
        .bind(tenant_id)
        .bind(payload)
        .bind(failure_reason)
        .bind(retry_count)
        .bind(last_error)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Lists dead-letter rows for a message, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_original(
        &self,
        message_id: MessageId,
        tenant_id: TenantId,
    ) -> Result<Vec<DeadLetterMessage>> {
        let rows = sqlx::query_as::<_, DeadLetterMessage>(
            r"
            SELECT original_message_id, tenant_id, payload, failure_reason,
                   retry_count, last_error, created_at
            FROM dead_letter_messages
            WHERE original_message_id = $1 AND tenant_id = $2
            ORDER BY created_at ASC
            ",
        )
        .bind(message_id)
        .bind(tenant_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _repo = Repository::new(Arc::new(pool));
    }
}
