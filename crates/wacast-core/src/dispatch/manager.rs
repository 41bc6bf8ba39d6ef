//! Campaign Manager - Handles campaign lifecycle and queue population

use super::audience::{validate_rule, AudienceResolver};
use super::error::DispatchError;
use super::queue::{schedule_offset, DispatchQueue};
use super::state::{next_status, CampaignAction};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wacast_common::config::{DispatchConfig, OrphanPolicy, MAX_SEND_RATE_SECONDS};
use wacast_common::types::{CampaignId, Paginated, TenantId};
use wacast_storage::models::{
    Campaign, CampaignStatus, CreateCampaign, DispatchTask, TargetingRule, TaskCounts, TaskStatus,
    UpdateCampaign,
};
use wacast_storage::repository::{CampaignStore, TaskStore};
use wacast_storage::Stores;

/// New campaign definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSpec {
    pub name: String,
    pub message_template: String,
    pub targeting_rule: TargetingRule,
    /// Delay between consecutive sends, defaults to the configured rate
    #[serde(default)]
    pub send_rate_seconds: Option<f64>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Which tasks a reset returns to `pending`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetMode {
    FailedOnly,
    All,
}

/// Campaign progress snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignProgress {
    pub campaign_id: CampaignId,
    pub status: CampaignStatus,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub failed_count: i32,
    pub pending: i64,
    pub sending: i64,
    pub cancelled: i64,
    pub progress_percent: f64,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Campaign Manager - owns every campaign status change made on behalf of a user
pub struct CampaignManager {
    campaigns: Arc<dyn CampaignStore>,
    tasks: Arc<dyn TaskStore>,
    queue: DispatchQueue,
    resolver: AudienceResolver,
    config: DispatchConfig,
}

impl CampaignManager {
    /// Create a new campaign manager
    pub fn new(stores: &Stores, config: DispatchConfig) -> Self {
        Self {
            campaigns: Arc::clone(&stores.campaigns),
            tasks: Arc::clone(&stores.tasks),
            queue: DispatchQueue::new(Arc::clone(&stores.tasks)),
            resolver: AudienceResolver::new(Arc::clone(&stores.contacts), config.phone_rules()),
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    /// Load a campaign regardless of tenant
    pub async fn campaign(&self, id: CampaignId) -> Result<Campaign, DispatchError> {
        self.campaigns
            .get(id)
            .await?
            .ok_or(DispatchError::NotFound)
    }

    async fn owned(&self, tenant_id: TenantId, id: CampaignId) -> Result<Campaign, DispatchError> {
        self.campaigns
            .get_by_tenant(tenant_id, id)
            .await?
            .ok_or(DispatchError::NotFound)
    }

    /// Create a campaign in `draft`, or `scheduled` when it has a future start time
    pub async fn create(
        &self,
        tenant_id: TenantId,
        spec: CampaignSpec,
    ) -> Result<Campaign, DispatchError> {
        let now = Utc::now();
        let name = spec.name.trim().to_string();
        if name.is_empty() {
            return Err(DispatchError::Validation("name must not be empty".to_string()));
        }
        validate_template(&spec.message_template)?;
        let send_rate_seconds = spec
            .send_rate_seconds
            .unwrap_or(self.config.default_send_rate_seconds);
        validate_rate(send_rate_seconds)?;
        validate_rule(&spec.targeting_rule, &self.config.phone_rules())?;
        if let Some(at) = spec.scheduled_for {
            validate_schedule(at, now)?;
        }

        let status = if spec.scheduled_for.is_some() {
            CampaignStatus::Scheduled
        } else {
            CampaignStatus::Draft
        };

        let campaign = self
            .campaigns
            .create(CreateCampaign {
                tenant_id,
                name,
                message_template: spec.message_template,
                targeting_rule: spec.targeting_rule,
                send_rate_seconds,
                scheduled_for: spec.scheduled_for,
                status,
            })
            .await?;

        info!(
            campaign_id = %campaign.id,
            %tenant_id,
            status = %campaign.status,
            rule = campaign.targeting_rule.kind(),
            "Campaign created"
        );

        Ok(campaign)
    }

    pub async fn get(&self, tenant_id: TenantId, id: CampaignId) -> Result<Campaign, DispatchError> {
        self.owned(tenant_id, id).await
    }

    pub async fn list(
        &self,
        tenant_id: TenantId,
        status: Option<CampaignStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Paginated<Campaign>, DispatchError> {
        let data = self
            .campaigns
            .list_by_tenant(tenant_id, status, limit, offset)
            .await?;
        let total = self.campaigns.count_by_tenant(tenant_id, status).await?;

        Ok(Paginated {
            data,
            total,
            limit,
            offset,
        })
    }

    /// Edit a draft
    pub async fn update(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
        mut changes: UpdateCampaign,
    ) -> Result<Campaign, DispatchError> {
        let campaign = self.owned(tenant_id, id).await?;
        if campaign.status != CampaignStatus::Draft {
            return Err(DispatchError::NotDraft {
                status: campaign.status,
            });
        }

        if let Some(name) = changes.name.as_mut() {
            *name = name.trim().to_string();
            if name.is_empty() {
                return Err(DispatchError::Validation("name must not be empty".to_string()));
            }
        }
        if let Some(template) = &changes.message_template {
            validate_template(template)?;
        }
        if let Some(rate) = changes.send_rate_seconds {
            validate_rate(rate)?;
        }
        if let Some(rule) = &changes.targeting_rule {
            validate_rule(rule, &self.config.phone_rules())?;
        }
        if let Some(at) = changes.scheduled_for {
            validate_schedule(at, Utc::now())?;
        }

        match self.campaigns.update_draft(id, changes).await? {
            Some(updated) => {
                debug!(campaign_id = %id, "Campaign updated");
                Ok(updated)
            }
            None => Err(DispatchError::NotDraft {
                status: self.campaign(id).await?.status,
            }),
        }
    }

    /// Delete a draft that was never dispatched
    pub async fn delete(&self, tenant_id: TenantId, id: CampaignId) -> Result<(), DispatchError> {
        let campaign = self.owned(tenant_id, id).await?;
        if campaign.status != CampaignStatus::Draft {
            return Err(DispatchError::NotDraft {
                status: campaign.status,
            });
        }

        if !self.campaigns.delete_draft(id).await? {
            return Err(DispatchError::Validation(
                "campaign has dispatch tasks and is kept as an audit trail".to_string(),
            ));
        }

        info!(campaign_id = %id, "Campaign deleted");
        Ok(())
    }

    /// Start a campaign.
    ///
    /// A draft with a future `scheduled_for` only becomes `scheduled`; a
    /// scheduled campaign is refused until its time has come. Otherwise the
    /// audience is resolved, the queue populated and the campaign set
    /// `running`. A campaign that already has tasks (after a reset) reuses
    /// its queue.
    pub async fn start(&self, tenant_id: TenantId, id: CampaignId) -> Result<Campaign, DispatchError> {
        self.start_at(tenant_id, id, Utc::now()).await
    }

    /// `start` as seen from `now`, used by the schedule trigger
    pub async fn start_at(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Campaign, DispatchError> {
        let campaign = self.owned(tenant_id, id).await?;

        match campaign.status {
            CampaignStatus::Draft if campaign.is_scheduled_after(now) => {
                let scheduled = self.apply(&campaign, CampaignAction::Schedule).await?;
                info!(campaign_id = %id, scheduled_for = ?scheduled.scheduled_for, "Campaign scheduled");
                return Ok(scheduled);
            }
            CampaignStatus::Scheduled => {
                if let Some(scheduled_for) = campaign.scheduled_for.filter(|at| *at > now) {
                    return Err(DispatchError::NotDue { scheduled_for });
                }
            }
            _ => {}
        }

        next_status(campaign.status, CampaignAction::Start)?;
        let total = self.populate_queue(&campaign).await?;
        let started = self.apply(&campaign, CampaignAction::Start).await?;

        info!(campaign_id = %id, recipients = total, "Campaign started");
        Ok(started)
    }

    async fn populate_queue(&self, campaign: &Campaign) -> Result<i64, DispatchError> {
        let existing = self.queue.counts(campaign.id).await?;
        let total = if existing.total() > 0 {
            debug!(campaign_id = %campaign.id, tasks = existing.total(), "Reusing existing queue");
            existing.total()
        } else {
            let recipients = self
                .resolver
                .resolve(campaign.tenant_id, &campaign.targeting_rule)
                .await?;
            self.queue
                .enqueue(
                    campaign.id,
                    &recipients,
                    &campaign.message_template,
                    campaign.send_rate_seconds,
                )
                .await? as i64
        };

        self.campaigns
            .set_total_recipients(campaign.id, clamp_count(total))
            .await?;
        Ok(total)
    }

    /// `running -> paused`
    pub async fn pause(&self, tenant_id: TenantId, id: CampaignId) -> Result<Campaign, DispatchError> {
        let campaign = self.owned(tenant_id, id).await?;
        let paused = self.apply(&campaign, CampaignAction::Pause).await?;
        info!(campaign_id = %id, "Campaign paused");
        Ok(paused)
    }

    /// `paused -> running`, keeping the existing queue
    pub async fn resume(&self, tenant_id: TenantId, id: CampaignId) -> Result<Campaign, DispatchError> {
        let campaign = self.owned(tenant_id, id).await?;
        let resumed = self.apply(&campaign, CampaignAction::Resume).await?;
        info!(campaign_id = %id, "Campaign resumed");
        Ok(resumed)
    }

    /// `running -> cancelled`, cancelling every pending task
    pub async fn cancel(&self, tenant_id: TenantId, id: CampaignId) -> Result<Campaign, DispatchError> {
        let campaign = self.owned(tenant_id, id).await?;
        self.apply(&campaign, CampaignAction::Cancel).await?;

        let cancelled = self.queue.cancel_pending(id).await?;
        self.refresh_counters(id).await?;

        info!(campaign_id = %id, cancelled_tasks = cancelled, "Campaign cancelled");
        self.campaign(id).await
    }

    /// Return a live campaign to `draft` and requeue its failed (or failed
    /// and cancelled) tasks. Sent tasks are never requeued.
    pub async fn reset(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
        mode: ResetMode,
    ) -> Result<Campaign, DispatchError> {
        let campaign = self.owned(tenant_id, id).await?;
        self.apply(&campaign, CampaignAction::Reset).await?;

        let requeued = match mode {
            ResetMode::FailedOnly => self.queue.reset_failed(id).await?,
            ResetMode::All => self.queue.reset_all(id).await?,
        };
        self.refresh_counters(id).await?;

        info!(campaign_id = %id, ?mode, requeued, "Campaign reset");
        self.campaign(id).await
    }

    pub async fn status(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
    ) -> Result<CampaignProgress, DispatchError> {
        let campaign = self.owned(tenant_id, id).await?;
        let counts = self.queue.counts(id).await?;

        let estimated_completion = if campaign.status == CampaignStatus::Running {
            schedule_offset(campaign.send_rate_seconds, counts.pending)
                .and_then(|offset| Utc::now().checked_add_signed(offset))
        } else {
            None
        };

        Ok(CampaignProgress {
            campaign_id: campaign.id,
            status: campaign.status,
            total_recipients: campaign.total_recipients,
            sent_count: campaign.sent_count,
            failed_count: campaign.failed_count,
            pending: counts.pending,
            sending: counts.sending,
            cancelled: counts.cancelled,
            progress_percent: campaign.progress_percentage(),
            estimated_completion,
            started_at: campaign.started_at,
            completed_at: campaign.completed_at,
        })
    }

    /// Per-recipient audit trail
    pub async fn list_tasks(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
        status: Option<TaskStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Paginated<DispatchTask>, DispatchError> {
        self.owned(tenant_id, id).await?;
        let data = self.queue.list(id, status, limit, offset).await?;
        let counts = self.queue.counts(id).await?;
        let total = match status {
            None => counts.total(),
            Some(TaskStatus::Pending) => counts.pending,
            Some(TaskStatus::Sending) => counts.sending,
            Some(TaskStatus::Sent) => counts.sent,
            Some(TaskStatus::Failed) => counts.failed,
            Some(TaskStatus::Cancelled) => counts.cancelled,
        };

        Ok(Paginated {
            data,
            total,
            limit,
            offset,
        })
    }

    /// Recompute the campaign counters from its tasks
    pub async fn refresh_counters(&self, id: CampaignId) -> Result<TaskCounts, DispatchError> {
        let counts = self.queue.counts(id).await?;
        self.campaigns
            .set_counters(id, clamp_count(counts.sent), clamp_count(counts.failed))
            .await?;
        Ok(counts)
    }

    /// Fail every task stuck in `sending` longer than the orphan timeout.
    ///
    /// The gateway may or may not have delivered those messages; failing
    /// them makes the outcome visible and lets a reset retry them.
    pub async fn reconcile_orphans(
        &self,
        campaign_id: Option<CampaignId>,
    ) -> Result<Vec<DispatchTask>, DispatchError> {
        let timeout = self.config.orphan_timeout_secs;
        let reason = format!(
            "orphaned: no outcome recorded within {}s of claiming, delivery unknown",
            timeout
        );
        let failed = self
            .tasks
            .fail_stale_sending(campaign_id, self.orphan_cutoff(), &reason)
            .await?;

        let affected: BTreeSet<CampaignId> = failed.iter().map(|t| t.campaign_id).collect();
        for id in &affected {
            self.refresh_counters(*id).await?;
        }

        if !failed.is_empty() {
            warn!(
                tasks = failed.len(),
                campaigns = affected.len(),
                "Reconciled orphaned sending tasks"
            );
        }
        Ok(failed)
    }

    /// Tenant-scoped explicit reconciliation
    pub async fn reconcile(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
    ) -> Result<Vec<DispatchTask>, DispatchError> {
        self.owned(tenant_id, id).await?;
        self.reconcile_orphans(Some(id)).await
    }

    /// Apply the orphan policy before a run. Returns the number of tasks
    /// reconciled, or `OrphanedTask` under the manual policy.
    pub async fn prepare_run(&self, id: CampaignId) -> Result<usize, DispatchError> {
        match self.config.orphan_policy {
            OrphanPolicy::Fail => Ok(self.reconcile_orphans(Some(id)).await?.len()),
            OrphanPolicy::Manual => {
                let stale = self
                    .tasks
                    .list_stale_sending(Some(id), self.orphan_cutoff())
                    .await?;
                if stale.is_empty() {
                    Ok(0)
                } else {
                    Err(DispatchError::OrphanedTask { count: stale.len() })
                }
            }
        }
    }

    fn orphan_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - Duration::seconds(self.config.orphan_timeout_secs as i64)
    }

    /// Scheduled campaigns whose start time has passed
    pub async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>, DispatchError> {
        Ok(self.campaigns.list_scheduled_ready(now).await?)
    }

    /// Campaigns persisted as `running`
    pub async fn running(&self) -> Result<Vec<Campaign>, DispatchError> {
        Ok(self.campaigns.list_by_status(CampaignStatus::Running).await?)
    }

    /// Compare-and-set the status change `action` implies
    pub(crate) async fn apply(
        &self,
        campaign: &Campaign,
        action: CampaignAction,
    ) -> Result<Campaign, DispatchError> {
        let to = next_status(campaign.status, action)?;
        match self.campaigns.transition(campaign.id, campaign.status, to).await? {
            Some(updated) => Ok(updated),
            None => {
                // status moved underneath us
                let current = self.campaign(campaign.id).await?;
                Err(DispatchError::InvalidTransition {
                    from: current.status,
                    action,
                })
            }
        }
    }
}

fn validate_template(template: &str) -> Result<(), DispatchError> {
    if template.trim().is_empty() {
        return Err(DispatchError::Validation(
            "message template must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_rate(rate: f64) -> Result<(), DispatchError> {
    if !rate.is_finite() || !(0.0..=MAX_SEND_RATE_SECONDS).contains(&rate) {
        return Err(DispatchError::Validation(format!(
            "send_rate_seconds must be between 0 and {}",
            MAX_SEND_RATE_SECONDS
        )));
    }
    Ok(())
}

fn validate_schedule(at: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), DispatchError> {
    if at <= now {
        return Err(DispatchError::Validation(
            "scheduled_for must be in the future".to_string(),
        ));
    }
    Ok(())
}

fn clamp_count(value: i64) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
