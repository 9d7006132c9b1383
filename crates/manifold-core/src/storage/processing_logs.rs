//! Repository for the append-only message processing audit trail.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{MessageId, ProcessingLog, ProcessingStatus, TenantId},
};

/// Repository for processing-log operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Appends an audit entry for one handler invocation.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn append(
        &self,
        message_id: MessageId,
        tenant_id: TenantId,
        worker_id: &str,
        status: ProcessingStatus,
        error_message: Option<&str>,
        duration_ms: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO message_processing_logs
                (message_id, tenant_id, worker_id, status, error_message, processing_duration_ms)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(message_id)
        .bind(tenant_id)
        .bind(worker_id)
        .bind(status)
        .bind(error_message)
        .bind(duration_ms)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Lists all audit entries for a message, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_message(
        &self,
        message_id: MessageId,
        tenant_id: TenantId,
    ) -> Result<Vec<ProcessingLog>> {
        let logs = sqlx::query_as::<_, ProcessingLog>(
            r"
            SELECT message_id, tenant_id, worker_id, status, error_message,
                   processing_duration_ms, created_at
            FROM message_processing_logs
            WHERE message_id = $1 AND tenant_id = $2
            ORDER BY created_at ASC
            ",
        )
        .bind(message_id)
        .bind(tenant_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(logs)
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
