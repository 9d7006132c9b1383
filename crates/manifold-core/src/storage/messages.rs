//! Repository for message rows in the list-partitioned messages table.
//!
//! Partition routing is transparent: every query targets the parent table
//! and Postgres resolves the tenant partition from `tenant_id`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Message, MessageId, MessageStatus, TenantId},
};

const MESSAGE_COLUMNS: &str = "id, tenant_id, payload, status, retry_count, max_retries, \
     scheduled_at, processed_at, created_at";

/// Keyset position for cursor pagination, ordered by `(created_at, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePosition {
    /// Creation timestamp of the last row on the previous page.
    pub created_at: DateTime<Utc>,
    /// ID of the last row on the previous page.
    pub id: MessageId,
}

/// Repository for message database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a freshly accepted message in `pending` state.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails, including when the tenant's
    /// partition does not exist.
    pub async fn insert(
        &self,
        message_id: MessageId,
        tenant_id: TenantId,
        payload: &serde_json::Value,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO messages (id, tenant_id, payload, status, scheduled_at)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(message_id)
        .bind(tenant_id)
        .bind(payload)
        .bind(MessageStatus::Pending)
        .bind(scheduled_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Upserts a message row into `processing` state, stamping
    /// `processed_at`. Used by the handler when a delivery arrives for a
    /// message the API did not persist first.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn upsert_processing(
        &self,
        message_id: MessageId,
        tenant_id: TenantId,
        payload: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO messages (id, tenant_id, payload, status, processed_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (id, tenant_id)
            DO UPDATE SET status = $4, processed_at = NOW()
            ",
        )
        .bind(message_id)
        .bind(tenant_id)
        .bind(payload)
        .bind(MessageStatus::Processing)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks a message with a terminal or intermediate status, stamping
    /// `processed_at`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update_status(
        &self,
        message_id: MessageId,
        tenant_id: TenantId,
        status: MessageStatus,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE messages
            SET status = $3, processed_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            ",
        )
        .bind(message_id)
        .bind(tenant_id)
        .bind(status)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Fetches one page of messages ordered by `(created_at, id)`.
    ///
    /// Fetches `limit + 1` rows so the caller can detect whether a next page
    /// exists; the extra row is returned and must be trimmed by the caller.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_page(
        &self,
        after: Option<PagePosition>,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let messages = match after {
            Some(position) => {
                sqlx::query_as::<_, Message>(&format!(
                    r"
                    SELECT {MESSAGE_COLUMNS} FROM messages
                    WHERE (created_at, id) > ($1, $2)
                    ORDER BY created_at ASC, id ASC
                    LIMIT $3
                    "
                ))
                .bind(position.created_at)
                .bind(position.id)
                .bind(limit + 1)
                .fetch_all(&*self.pool)
                .await?
            },
            None => {
                sqlx::query_as::<_, Message>(&format!(
                    r"
                    SELECT {MESSAGE_COLUMNS} FROM messages
                    ORDER BY created_at ASC, id ASC
                    LIMIT $1
                    "
                ))
                .bind(limit + 1)
                .fetch_all(&*self.pool)
                .await?
            },
        };

        Ok(messages)
    }

    /// Fetches a single message by its composite key.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(
        &self,
        message_id: MessageId,
        tenant_id: TenantId,
    ) -> Result<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1 AND tenant_id = $2"
        ))
        .bind(message_id)
        .bind(tenant_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(message)
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
