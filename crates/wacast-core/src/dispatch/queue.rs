//! Dispatch Queue - persisted per-recipient send tasks

use super::error::DispatchError;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::debug;
use wacast_common::types::{CampaignId, TaskId};
use wacast_storage::models::{DispatchTask, NewDispatchTask, Recipient, TaskCounts, TaskStatus};
use wacast_storage::repository::TaskStore;

/// Ordered queue of dispatch tasks, backed by the task store
#[derive(Clone)]
pub struct DispatchQueue {
    tasks: Arc<dyn TaskStore>,
}

impl DispatchQueue {
    pub fn new(tasks: Arc<dyn TaskStore>) -> Self {
        Self { tasks }
    }

    /// Add one pending task per recipient.
    ///
    /// Task `i` is scheduled at `now + i * rate_seconds`. The schedule only
    /// orders and estimates; pacing is done by the sender loop.
    pub async fn enqueue(
        &self,
        campaign_id: CampaignId,
        recipients: &[Recipient],
        message_template: &str,
        rate_seconds: f64,
    ) -> Result<u64, DispatchError> {
        let now = Utc::now();

        let tasks = recipients
            .iter()
            .enumerate()
            .map(|(index, recipient)| {
                let scheduled_time = schedule_offset(rate_seconds, index as i64)
                    .and_then(|offset| now.checked_add_signed(offset))
                    .ok_or_else(|| {
                        DispatchError::Validation(format!(
                            "send_rate_seconds {} is too large to schedule {} recipients",
                            rate_seconds,
                            recipients.len()
                        ))
                    })?;
                Ok(NewDispatchTask {
                    campaign_id,
                    position: index as i32,
                    recipient: recipient.clone(),
                    message_template: message_template.to_string(),
                    scheduled_time,
                })
            })
            .collect::<Result<Vec<_>, DispatchError>>()?;

        let count = self.tasks.enqueue(tasks).await?;
        debug!(%campaign_id, count, "Enqueued dispatch tasks");
        Ok(count)
    }

    pub async fn next_pending(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Option<DispatchTask>, DispatchError> {
        Ok(self.tasks.next_pending(campaign_id).await?)
    }

    /// Claim the next pending task for sending
    pub async fn claim_next(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Option<DispatchTask>, DispatchError> {
        Ok(self.tasks.claim_next(campaign_id).await?)
    }

    pub async fn mark_sending(&self, task_id: TaskId) -> Result<bool, DispatchError> {
        Ok(self.tasks.mark_sending(task_id).await?)
    }

    pub async fn mark_sent(
        &self,
        task_id: TaskId,
        provider_message_id: &str,
    ) -> Result<bool, DispatchError> {
        Ok(self.tasks.mark_sent(task_id, provider_message_id).await?)
    }

    pub async fn mark_failed(&self, task_id: TaskId, error: &str) -> Result<bool, DispatchError> {
        Ok(self.tasks.mark_failed(task_id, error).await?)
    }

    pub async fn cancel_pending(&self, campaign_id: CampaignId) -> Result<u64, DispatchError> {
        Ok(self.tasks.cancel_pending(campaign_id).await?)
    }

    pub async fn reset_failed(&self, campaign_id: CampaignId) -> Result<u64, DispatchError> {
        Ok(self.tasks.reset_failed(campaign_id).await?)
    }

    pub async fn reset_all(&self, campaign_id: CampaignId) -> Result<u64, DispatchError> {
        Ok(self.tasks.reset_all(campaign_id).await?)
    }

    pub async fn counts(&self, campaign_id: CampaignId) -> Result<TaskCounts, DispatchError> {
        Ok(self.tasks.status_counts(campaign_id).await?)
    }

    pub async fn list(
        &self,
        campaign_id: CampaignId,
        status: Option<TaskStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DispatchTask>, DispatchError> {
        Ok(self
            .tasks
            .list_by_campaign(campaign_id, status, limit, offset)
            .await?)
    }
}

/// Offset of the `index`-th send at `rate_seconds` apart, `None` on overflow
pub(crate) fn schedule_offset(rate_seconds: f64, index: i64) -> Option<Duration> {
    let step_ms = (rate_seconds.max(0.0) * 1000.0).round();
    if !step_ms.is_finite() || step_ms > i64::MAX as f64 {
        return None;
    }
    (step_ms as i64)
        .checked_mul(index)
        .and_then(Duration::try_milliseconds)
}
