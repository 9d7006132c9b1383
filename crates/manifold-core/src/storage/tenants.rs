//! Repository for tenant database operations.
//!
//! Manages the tenant lifecycle: transactional creation together with the
//! tenant's message partition, bootstrap listing, concurrency persistence,
//! and soft deletion.

use std::sync::Arc;

use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{Tenant, TenantId, TenantStatus},
};

const TENANT_COLUMNS: &str = "id, name, status, max_workers, current_workers, \
     queue_name, consumer_tag, created_at, updated_at, deleted_at";

/// Repository for tenant database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Begins a transaction for a multi-statement tenant operation.
    ///
    /// # Errors
    ///
    /// Returns error if a connection cannot be acquired.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Inserts a tenant row within a transaction.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` on an ID collision, `Storage` otherwise.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant: &Tenant,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO tenants
                (id, name, status, max_workers, current_workers, queue_name, consumer_tag)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(tenant.id)
        .bind(&tenant.name)
        .bind(tenant.status)
        .bind(tenant.max_workers)
        .bind(tenant.current_workers)
        .bind(&tenant.queue_name)
        .bind(&tenant.consumer_tag)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Creates the tenant's list partition of the messages table within the
    /// same transaction as the tenant insert.
    ///
    /// Postgres DDL is transactional, so a rollback before commit removes
    /// the partition together with the tenant row.
    ///
    /// # Errors
    ///
    /// Returns error if the DDL fails.
    pub async fn create_partition_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: TenantId,
    ) -> Result<()> {
        // Identifiers cannot be bound; both fragments derive from a UUID and
        // are injection-safe.
        let ddl = format!(
            "CREATE TABLE {} PARTITION OF messages FOR VALUES IN ('{}')",
            tenant_id.partition_name(),
            tenant_id.0
        );

        sqlx::query(&ddl).execute(&mut **tx).await?;

        Ok(())
    }

    /// Finds a live tenant by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, tenant_id: TenantId) -> Result<Option<Tenant>> {
        let tenant = sqlx::query_as::<_, Tenant>(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(tenant_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(tenant)
    }

    /// Lists every non-deleted tenant, oldest first. Used at bootstrap to
    /// restore consumers.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_active(&self) -> Result<Vec<Tenant>> {
        let tenants = sqlx::query_as::<_, Tenant>(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE deleted_at IS NULL ORDER BY created_at ASC"
        ))
        .fetch_all(&*self.pool)
        .await?;

        Ok(tenants)
    }

    /// Soft-deletes a tenant: sets status to `stopped` and stamps
    /// `deleted_at`. Returns the number of rows updated; zero means the
    /// tenant was absent or already deleted.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn soft_delete(&self, tenant_id: TenantId) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE tenants
            SET status = $2, deleted_at = $3, updated_at = $3
            WHERE id = $1 AND deleted_at IS NULL
            ",
        )
        .bind(tenant_id)
        .bind(TenantStatus::Stopped)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Persists a new current worker count for a tenant.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update_current_workers(&self, tenant_id: TenantId, workers: i32) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE tenants
            SET current_workers = $2, updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            ",
        )
        .bind(tenant_id)
        .bind(workers)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
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
