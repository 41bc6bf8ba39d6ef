//! Contact repository

use crate::db::DatabasePool;
use crate::models::{Contact, ContactFilter};
use async_trait::async_trait;
use wacast_common::types::TenantId;
use wacast_common::{Error, Result};

/// Read-only view of the tenant's contact book
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Contacts of `tenant_id` matching every criterion of `filter`,
    /// in creation order
    async fn find_contacts(&self, tenant_id: TenantId, filter: &ContactFilter)
        -> Result<Vec<Contact>>;
}

/// Database contact repository
pub struct DbContactRepository {
    pool: DatabasePool,
}

impl DbContactRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContactStore for DbContactRepository {
    async fn find_contacts(
        &self,
        tenant_id: TenantId,
        filter: &ContactFilter,
    ) -> Result<Vec<Contact>> {
        sqlx::query_as::<_, Contact>(
            r#"
            SELECT * FROM contacts
            WHERE tenant_id = $1
              AND ($2::text[] IS NULL OR tags && $2)
              AND ($3::uuid[] IS NULL OR group_ids && $3)
              AND ($4::uuid[] IS NULL OR id = ANY($4))
              AND (NOT $5 OR active)
              AND (NOT $6 OR NOT opt_out)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(tenant_id)
        .bind(&filter.tags)
        .bind(&filter.group_ids)
        .bind(&filter.ids)
        .bind(filter.active_only)
        .bind(filter.exclude_opt_out)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}
