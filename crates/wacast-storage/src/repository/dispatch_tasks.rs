//! Dispatch task repository

use crate::db::DatabasePool;
use crate::models::{DispatchTask, NewDispatchTask, TaskCounts, TaskStatus};
use crate::repository::is_unique_violation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;
use wacast_common::types::{CampaignId, TaskId};
use wacast_common::{Error, Result};

/// Dispatch task repository trait
///
/// Every status change is a compare-and-set on the current status, so two
/// callers can never move the same task through the same transition.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert tasks in one transaction, returns the number inserted
    async fn enqueue(&self, tasks: Vec<NewDispatchTask>) -> Result<u64>;
    /// Lowest `(scheduled_time, position)` pending task
    async fn next_pending(&self, campaign_id: CampaignId) -> Result<Option<DispatchTask>>;
    /// Atomically move the next pending task to `sending`. Returns `None`
    /// when nothing is pending or another task of the campaign is in flight.
    async fn claim_next(&self, campaign_id: CampaignId) -> Result<Option<DispatchTask>>;
    /// `pending -> sending`
    async fn mark_sending(&self, id: TaskId) -> Result<bool>;
    /// `sending -> sent`
    async fn mark_sent(&self, id: TaskId, provider_message_id: &str) -> Result<bool>;
    /// `sending -> failed`
    async fn mark_failed(&self, id: TaskId, error: &str) -> Result<bool>;
    /// `pending -> cancelled` for the whole campaign
    async fn cancel_pending(&self, campaign_id: CampaignId) -> Result<u64>;
    /// `failed -> pending`, clearing the error
    async fn reset_failed(&self, campaign_id: CampaignId) -> Result<u64>;
    /// `failed | cancelled -> pending`; sent and in-flight tasks are kept
    async fn reset_all(&self, campaign_id: CampaignId) -> Result<u64>;
    async fn status_counts(&self, campaign_id: CampaignId) -> Result<TaskCounts>;
    async fn list_by_campaign(
        &self,
        campaign_id: CampaignId,
        status: Option<TaskStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DispatchTask>>;
    /// Tasks stuck in `sending` since before `cutoff`
    async fn list_stale_sending(
        &self,
        campaign_id: Option<CampaignId>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DispatchTask>>;
    /// Move tasks stuck in `sending` since before `cutoff` to `failed`
    async fn fail_stale_sending(
        &self,
        campaign_id: Option<CampaignId>,
        cutoff: DateTime<Utc>,
        error: &str,
    ) -> Result<Vec<DispatchTask>>;
}

/// Database dispatch task repository
pub struct DbTaskRepository {
    pool: DatabasePool,
}

impl DbTaskRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for DbTaskRepository {
    async fn enqueue(&self, tasks: Vec<NewDispatchTask>) -> Result<u64> {
        let mut count = 0u64;
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        for input in tasks {
            let result = sqlx::query(
                r#"
                INSERT INTO dispatch_tasks (
                    id, campaign_id, position, phone, display_name,
                    message_template, status, scheduled_time
                )
                VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(input.campaign_id)
            .bind(input.position)
            .bind(input.recipient.phone.as_str())
            .bind(&input.recipient.display_name)
            .bind(&input.message_template)
            .bind(input.scheduled_time)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

            count += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count)
    }

    async fn next_pending(&self, campaign_id: CampaignId) -> Result<Option<DispatchTask>> {
        sqlx::query_as::<_, DispatchTask>(
            r#"
            SELECT * FROM dispatch_tasks
            WHERE campaign_id = $1 AND status = 'pending'
            ORDER BY scheduled_time ASC, position ASC
            LIMIT 1
            "#,
        )
        .bind(campaign_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn claim_next(&self, campaign_id: CampaignId) -> Result<Option<DispatchTask>> {
        let claimed = sqlx::query_as::<_, DispatchTask>(
            r#"
            UPDATE dispatch_tasks SET
                status = 'sending',
                claimed_at = NOW(),
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM dispatch_tasks
                WHERE campaign_id = $1 AND status = 'pending'
                ORDER BY scheduled_time ASC, position ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
              AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(campaign_id)
        .fetch_optional(self.pool.pool())
        .await;

        match claimed {
            Ok(task) => Ok(task),
            // another task of the campaign is already in flight
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(Error::Database(e.to_string())),
        }
    }

    async fn mark_sending(&self, id: TaskId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_tasks SET
                status = 'sending',
                claimed_at = NOW(),
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await;

        match result {
            Ok(result) => Ok(result.rows_affected() > 0),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(Error::Database(e.to_string())),
        }
    }

    async fn mark_sent(&self, id: TaskId, provider_message_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_tasks SET
                status = 'sent',
                provider_message_id = $2,
                error = NULL,
                sent_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(id)
        .bind(provider_message_id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, id: TaskId, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_tasks SET
                status = 'failed',
                error = $2,
                provider_message_id = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel_pending(&self, campaign_id: CampaignId) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_tasks SET
                status = 'cancelled',
                updated_at = NOW()
            WHERE campaign_id = $1 AND status = 'pending'
            "#,
        )
        .bind(campaign_id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn reset_failed(&self, campaign_id: CampaignId) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_tasks SET
                status = 'pending',
                error = NULL,
                provider_message_id = NULL,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE campaign_id = $1 AND status = 'failed'
            "#,
        )
        .bind(campaign_id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn reset_all(&self, campaign_id: CampaignId) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_tasks SET
                status = 'pending',
                error = NULL,
                provider_message_id = NULL,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE campaign_id = $1 AND status IN ('failed', 'cancelled')
            "#,
        )
        .bind(campaign_id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn status_counts(&self, campaign_id: CampaignId) -> Result<TaskCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'sending') as sending,
                COUNT(*) FILTER (WHERE status = 'sent') as sent,
                COUNT(*) FILTER (WHERE status = 'failed') as failed,
                COUNT(*) FILTER (WHERE status = 'cancelled') as cancelled
            FROM dispatch_tasks
            WHERE campaign_id = $1
            "#,
        )
        .bind(campaign_id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(TaskCounts {
            pending: row.get::<Option<i64>, _>("pending").unwrap_or(0),
            sending: row.get::<Option<i64>, _>("sending").unwrap_or(0),
            sent: row.get::<Option<i64>, _>("sent").unwrap_or(0),
            failed: row.get::<Option<i64>, _>("failed").unwrap_or(0),
            cancelled: row.get::<Option<i64>, _>("cancelled").unwrap_or(0),
        })
    }

    async fn list_by_campaign(
        &self,
        campaign_id: CampaignId,
        status: Option<TaskStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DispatchTask>> {
        sqlx::query_as::<_, DispatchTask>(
            r#"
            SELECT * FROM dispatch_tasks
            WHERE campaign_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY scheduled_time ASC, position ASC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(campaign_id)
        .bind(status.map(|s| s.to_string()))
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_stale_sending(
        &self,
        campaign_id: Option<CampaignId>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DispatchTask>> {
        sqlx::query_as::<_, DispatchTask>(
            r#"
            SELECT * FROM dispatch_tasks
            WHERE status = 'sending'
              AND claimed_at < $2
              AND ($1::uuid IS NULL OR campaign_id = $1)
            ORDER BY claimed_at ASC
            "#,
        )
        .bind(campaign_id)
        .bind(cutoff)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn fail_stale_sending(
        &self,
        campaign_id: Option<CampaignId>,
        cutoff: DateTime<Utc>,
        error: &str,
    ) -> Result<Vec<DispatchTask>> {
        sqlx::query_as::<_, DispatchTask>(
            r#"
            UPDATE dispatch_tasks SET
                status = 'failed',
                error = $3,
                updated_at = NOW()
            WHERE status = 'sending'
              AND claimed_at < $2
              AND ($1::uuid IS NULL OR campaign_id = $1)
            RETURNING *
            "#,
        )
        .bind(campaign_id)
        .bind(cutoff)
        .bind(error)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}
