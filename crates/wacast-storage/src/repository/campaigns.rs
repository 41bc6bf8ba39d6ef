//! Campaign repository

use crate::db::DatabasePool;
use crate::models::{Campaign, CampaignStatus, CreateCampaign, UpdateCampaign};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;
use wacast_common::types::{CampaignId, TenantId};
use wacast_common::{Error, Result};

/// Campaign repository trait
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn create(&self, input: CreateCampaign) -> Result<Campaign>;
    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>>;
    async fn get_by_tenant(&self, tenant_id: TenantId, id: CampaignId)
        -> Result<Option<Campaign>>;
    async fn list_by_tenant(
        &self,
        tenant_id: TenantId,
        status: Option<CampaignStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Campaign>>;
    async fn count_by_tenant(
        &self,
        tenant_id: TenantId,
        status: Option<CampaignStatus>,
    ) -> Result<i64>;
    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>>;
    /// Scheduled campaigns whose `scheduled_for` is at or before `now`
    async fn list_scheduled_ready(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>>;
    /// Apply `input` if the campaign is still a draft. `None` otherwise.
    async fn update_draft(&self, id: CampaignId, input: UpdateCampaign)
        -> Result<Option<Campaign>>;
    /// Delete a draft that never had dispatch tasks
    async fn delete_draft(&self, id: CampaignId) -> Result<bool>;
    /// Compare-and-set the status. Returns `None` when the campaign is not in `from`.
    ///
    /// Entering `running` stamps `started_at` once, entering a terminal status
    /// stamps `completed_at`, returning to `draft` clears both.
    async fn transition(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> Result<Option<Campaign>>;
    async fn set_total_recipients(&self, id: CampaignId, total: i32) -> Result<()>;
    async fn set_counters(&self, id: CampaignId, sent: i32, failed: i32) -> Result<()>;
}

/// Database campaign repository
pub struct DbCampaignRepository {
    pool: DatabasePool,
}

impl DbCampaignRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignStore for DbCampaignRepository {
    async fn create(&self, input: CreateCampaign) -> Result<Campaign> {
        let id = Uuid::now_v7();

        sqlx::query_as::<_, Campaign>(
            r#"
            INSERT INTO campaigns (
                id, tenant_id, name, message_template, targeting_rule,
                send_rate_seconds, status, scheduled_for
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.tenant_id)
        .bind(&input.name)
        .bind(&input.message_template)
        .bind(Json(&input.targeting_rule))
        .bind(input.send_rate_seconds)
        .bind(input.status.to_string())
        .bind(input.scheduled_for)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get_by_tenant(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
    ) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1 AND tenant_id = $2")
            .bind(id)
            .bind(tenant_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_by_tenant(
        &self,
        tenant_id: TenantId,
        status: Option<CampaignStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM campaigns
            WHERE tenant_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(tenant_id)
        .bind(status.map(|s| s.to_string()))
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn count_by_tenant(
        &self,
        tenant_id: TenantId,
        status: Option<CampaignStatus>,
    ) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM campaigns WHERE tenant_id = $1 AND ($2::text IS NULL OR status = $2)",
        )
        .bind(tenant_id)
        .bind(status.map(|s| s.to_string()))
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(count.0)
    }

    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            "SELECT * FROM campaigns WHERE status = $1 ORDER BY created_at ASC",
        )
        .bind(status.to_string())
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_scheduled_ready(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM campaigns
            WHERE status = 'scheduled'
              AND (scheduled_for IS NULL OR scheduled_for <= $1)
            ORDER BY scheduled_for ASC NULLS FIRST
            "#,
        )
        .bind(now)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn update_draft(
        &self,
        id: CampaignId,
        input: UpdateCampaign,
    ) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns SET
                name = COALESCE($2, name),
                message_template = COALESCE($3, message_template),
                targeting_rule = COALESCE($4, targeting_rule),
                send_rate_seconds = COALESCE($5, send_rate_seconds),
                scheduled_for = COALESCE($6, scheduled_for),
                updated_at = NOW()
            WHERE id = $1 AND status = 'draft'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.name)
        .bind(input.message_template)
        .bind(input.targeting_rule.map(Json))
        .bind(input.send_rate_seconds)
        .bind(input.scheduled_for)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn delete_draft(&self, id: CampaignId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM campaigns
            WHERE id = $1 AND status = 'draft'
              AND NOT EXISTS (SELECT 1 FROM dispatch_tasks WHERE campaign_id = $1)
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn transition(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns SET
                status = $3,
                started_at = CASE
                    WHEN $3 = 'running' THEN COALESCE(started_at, NOW())
                    WHEN $3 = 'draft' THEN NULL
                    ELSE started_at
                END,
                completed_at = CASE
                    WHEN $3 IN ('completed', 'cancelled') THEN NOW()
                    WHEN $3 = 'draft' THEN NULL
                    ELSE completed_at
                END,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(from.to_string())
        .bind(to.to_string())
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn set_total_recipients(&self, id: CampaignId, total: i32) -> Result<()> {
        sqlx::query(
            "UPDATE campaigns SET total_recipients = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(total)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn set_counters(&self, id: CampaignId, sent: i32, failed: i32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaigns SET
                sent_count = $2,
                failed_count = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(sent)
        .bind(failed)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}
