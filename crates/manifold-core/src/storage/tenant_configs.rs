//! Repository for tenant configuration key/values.
//!
//! The `concurrency` key is written by `UpdateConcurrency` and read back at
//! bootstrap; writes are conditional on the tenant still being live so the
//! caller can distinguish a missing tenant from a successful upsert.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{ConcurrencyConfig, TenantConfig, TenantId, CONCURRENCY_CONFIG_KEY},
};

/// Repository for tenant configuration operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Upserts the `concurrency` config row for a tenant.
    ///
    /// The write is keyed on `(tenant_id, config_key)` and only happens when
    /// the tenant exists and is not soft-deleted. Returns the number of rows
    /// written; zero means the tenant is absent.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn upsert_concurrency(
        &self,
        tenant_id: TenantId,
        config: ConcurrencyConfig,
    ) -> Result<u64> {
        let value = serde_json::to_value(config)
            .map_err(|e| crate::error::CoreError::Validation(e.to_string()))?;

        let result = sqlx::query(
            r"
            INSERT INTO tenant_configs (tenant_id, config_key, config_value)
            SELECT id, $2, $3 FROM tenants WHERE id = $1 AND deleted_at IS NULL
            ON CONFLICT (tenant_id, config_key)
            DO UPDATE SET config_value = EXCLUDED.config_value, updated_at = NOW()
            ",
        )
        .bind(tenant_id)
        .bind(CONCURRENCY_CONFIG_KEY)
        .bind(value)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Reads a config row by tenant and key.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, tenant_id: TenantId, key: &str) -> Result<Option<TenantConfig>> {
        let config = sqlx::query_as::<_, TenantConfig>(
            r"
            SELECT tenant_id, config_key, config_value, updated_at
            FROM tenant_configs
            WHERE tenant_id = $1 AND config_key = $2
            ",
        )
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(config)
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
