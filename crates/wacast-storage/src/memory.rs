//! In-memory store
//!
//! Implements every store trait over a single mutex-guarded state, with the
//! same compare-and-set semantics as the PostgreSQL repositories. Used by the
//! `memory` database backend and by tests.

use crate::models::{
    Campaign, CampaignStatus, Contact, ContactFilter, CreateCampaign, DispatchTask,
    NewDispatchTask, TaskCounts, TaskStatus, UpdateCampaign,
};
use crate::repository::{CampaignStore, ContactStore, TaskStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;
use wacast_common::types::{CampaignId, TaskId, TenantId};
use wacast_common::{Error, Result};

#[derive(Default)]
struct State {
    contacts: Vec<Contact>,
    campaigns: HashMap<CampaignId, Campaign>,
    tasks: Vec<DispatchTask>,
}

impl State {
    fn campaign_mut(&mut self, id: CampaignId) -> Result<&mut Campaign> {
        self.campaigns
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("campaign {}", id)))
    }

    fn has_sending(&self, campaign_id: CampaignId) -> bool {
        self.tasks
            .iter()
            .any(|t| t.campaign_id == campaign_id && t.status == TaskStatus::Sending)
    }

    fn pending_order(&self, campaign_id: CampaignId) -> Vec<usize> {
        let mut pending: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.campaign_id == campaign_id && t.status == TaskStatus::Pending)
            .map(|(i, _)| i)
            .collect();
        pending.sort_by_key(|&i| (self.tasks[i].scheduled_time, self.tasks[i].position));
        pending
    }

    fn claim(&mut self, index: usize) {
        let now = Utc::now();
        let task = &mut self.tasks[index];
        task.status = TaskStatus::Sending;
        task.claimed_at = Some(now);
        task.attempts += 1;
        task.updated_at = now;
    }

    fn is_stale(task: &DispatchTask, campaign_id: Option<CampaignId>, cutoff: DateTime<Utc>) -> bool {
        task.status == TaskStatus::Sending
            && campaign_id.map_or(true, |id| task.campaign_id == id)
            && task.claimed_at.map_or(false, |at| at < cutoff)
    }
}

/// In-memory implementation of all stores
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("memory store lock poisoned".to_string()))
    }

    /// Add a contact to the contact book
    pub fn insert_contact(&self, contact: Contact) -> Result<()> {
        self.state()?.contacts.push(contact);
        Ok(())
    }

    /// Backdate a task's claim, used to simulate a crashed sender
    pub fn set_claimed_at(&self, id: TaskId, claimed_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state()?;
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::NotFound(format!("task {}", id)))?;
        task.claimed_at = Some(claimed_at);
        Ok(())
    }
}

#[async_trait]
impl ContactStore for MemoryStore {
    async fn find_contacts(
        &self,
        tenant_id: TenantId,
        filter: &ContactFilter,
    ) -> Result<Vec<Contact>> {
        let state = self.state()?;
        Ok(state
            .contacts
            .iter()
            .filter(|c| c.tenant_id == tenant_id && filter.matches(c))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn create(&self, input: CreateCampaign) -> Result<Campaign> {
        let now = Utc::now();
        let campaign = Campaign {
            id: Uuid::now_v7(),
            tenant_id: input.tenant_id,
            name: input.name,
            message_template: input.message_template,
            targeting_rule: input.targeting_rule,
            send_rate_seconds: input.send_rate_seconds,
            status: input.status,
            scheduled_for: input.scheduled_for,
            total_recipients: 0,
            sent_count: 0,
            failed_count: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        self.state()?.campaigns.insert(campaign.id, campaign.clone());
        Ok(campaign)
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.state()?.campaigns.get(&id).cloned())
    }

    async fn get_by_tenant(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
    ) -> Result<Option<Campaign>> {
        Ok(self
            .state()?
            .campaigns
            .get(&id)
            .filter(|c| c.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_by_tenant(
        &self,
        tenant_id: TenantId,
        status: Option<CampaignStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Campaign>> {
        let state = self.state()?;
        let mut campaigns: Vec<Campaign> = state
            .campaigns
            .values()
            .filter(|c| c.tenant_id == tenant_id && status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        campaigns.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(campaigns
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count_by_tenant(
        &self,
        tenant_id: TenantId,
        status: Option<CampaignStatus>,
    ) -> Result<i64> {
        let state = self.state()?;
        Ok(state
            .campaigns
            .values()
            .filter(|c| c.tenant_id == tenant_id && status.map_or(true, |s| c.status == s))
            .count() as i64)
    }

    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
        let state = self.state()?;
        let mut campaigns: Vec<Campaign> = state
            .campaigns
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect();
        campaigns.sort_by_key(|c| c.created_at);
        Ok(campaigns)
    }

    async fn list_scheduled_ready(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let state = self.state()?;
        let mut campaigns: Vec<Campaign> = state
            .campaigns
            .values()
            .filter(|c| {
                c.status == CampaignStatus::Scheduled && c.scheduled_for.map_or(true, |at| at <= now)
            })
            .cloned()
            .collect();
        campaigns.sort_by_key(|c| c.scheduled_for);
        Ok(campaigns)
    }

    async fn update_draft(
        &self,
        id: CampaignId,
        input: UpdateCampaign,
    ) -> Result<Option<Campaign>> {
        let mut state = self.state()?;
        let Some(campaign) = state.campaigns.get_mut(&id) else {
            return Ok(None);
        };
        if campaign.status != CampaignStatus::Draft {
            return Ok(None);
        }

        if let Some(name) = input.name {
            campaign.name = name;
        }
        if let Some(template) = input.message_template {
            campaign.message_template = template;
        }
        if let Some(rule) = input.targeting_rule {
            campaign.targeting_rule = rule;
        }
        if let Some(rate) = input.send_rate_seconds {
            campaign.send_rate_seconds = rate;
        }
        if let Some(at) = input.scheduled_for {
            campaign.scheduled_for = Some(at);
        }
        campaign.updated_at = Utc::now();

        Ok(Some(campaign.clone()))
    }

    async fn delete_draft(&self, id: CampaignId) -> Result<bool> {
        let mut state = self.state()?;
        let deletable = state
            .campaigns
            .get(&id)
            .map_or(false, |c| c.status == CampaignStatus::Draft)
            && !state.tasks.iter().any(|t| t.campaign_id == id);

        if deletable {
            state.campaigns.remove(&id);
        }
        Ok(deletable)
    }

    async fn transition(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> Result<Option<Campaign>> {
        let mut state = self.state()?;
        let Some(campaign) = state.campaigns.get_mut(&id) else {
            return Ok(None);
        };
        if campaign.status != from {
            return Ok(None);
        }

        let now = Utc::now();
        campaign.status = to;
        match to {
            CampaignStatus::Running => {
                campaign.started_at.get_or_insert(now);
            }
            CampaignStatus::Completed | CampaignStatus::Cancelled => {
                campaign.completed_at = Some(now);
            }
            CampaignStatus::Draft => {
                campaign.started_at = None;
                campaign.completed_at = None;
            }
            CampaignStatus::Scheduled | CampaignStatus::Paused => {}
        }
        campaign.updated_at = now;

        Ok(Some(campaign.clone()))
    }

    async fn set_total_recipients(&self, id: CampaignId, total: i32) -> Result<()> {
        let mut state = self.state()?;
        let campaign = state.campaign_mut(id)?;
        campaign.total_recipients = total;
        campaign.updated_at = Utc::now();
        Ok(())
    }

    async fn set_counters(&self, id: CampaignId, sent: i32, failed: i32) -> Result<()> {
        let mut state = self.state()?;
        let campaign = state.campaign_mut(id)?;
        if sent + failed > campaign.total_recipients {
            return Err(Error::Database(format!(
                "counters {} + {} exceed total {}",
                sent, failed, campaign.total_recipients
            )));
        }
        campaign.sent_count = sent;
        campaign.failed_count = failed;
        campaign.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn enqueue(&self, tasks: Vec<NewDispatchTask>) -> Result<u64> {
        let mut state = self.state()?;
        let now = Utc::now();
        let mut inserted = Vec::with_capacity(tasks.len());

        for input in tasks {
            if !state.campaigns.contains_key(&input.campaign_id) {
                return Err(Error::Database(format!(
                    "campaign {} does not exist",
                    input.campaign_id
                )));
            }
            let duplicate = state.tasks.iter().chain(inserted.iter()).any(|t: &DispatchTask| {
                t.campaign_id == input.campaign_id
                    && (t.position == input.position || t.phone == input.recipient.phone.as_str())
            });
            if duplicate {
                return Err(Error::Database(format!(
                    "duplicate dispatch task for campaign {}",
                    input.campaign_id
                )));
            }

            inserted.push(DispatchTask {
                id: Uuid::now_v7(),
                campaign_id: input.campaign_id,
                position: input.position,
                phone: input.recipient.phone.as_str().to_string(),
                display_name: input.recipient.display_name,
                message_template: input.message_template,
                status: TaskStatus::Pending,
                scheduled_time: input.scheduled_time,
                claimed_at: None,
                attempts: 0,
                error: None,
                provider_message_id: None,
                sent_at: None,
                created_at: now,
                updated_at: now,
            });
        }

        let count = inserted.len() as u64;
        state.tasks.extend(inserted);
        Ok(count)
    }

    async fn next_pending(&self, campaign_id: CampaignId) -> Result<Option<DispatchTask>> {
        let state = self.state()?;
        Ok(state
            .pending_order(campaign_id)
            .first()
            .map(|&i| state.tasks[i].clone()))
    }

    async fn claim_next(&self, campaign_id: CampaignId) -> Result<Option<DispatchTask>> {
        let mut state = self.state()?;
        if state.has_sending(campaign_id) {
            return Ok(None);
        }
        let Some(&index) = state.pending_order(campaign_id).first() else {
            return Ok(None);
        };
        state.claim(index);
        Ok(Some(state.tasks[index].clone()))
    }

    async fn mark_sending(&self, id: TaskId) -> Result<bool> {
        let mut state = self.state()?;
        let Some(index) = state.tasks.iter().position(|t| t.id == id) else {
            return Ok(false);
        };
        let campaign_id = state.tasks[index].campaign_id;
        if state.tasks[index].status != TaskStatus::Pending || state.has_sending(campaign_id) {
            return Ok(false);
        }
        state.claim(index);
        Ok(true)
    }

    async fn mark_sent(&self, id: TaskId, provider_message_id: &str) -> Result<bool> {
        let mut state = self.state()?;
        let Some(task) = state
            .tasks
            .iter_mut()
            .find(|t| t.id == id && t.status == TaskStatus::Sending)
        else {
            return Ok(false);
        };
        let now = Utc::now();
        task.status = TaskStatus::Sent;
        task.provider_message_id = Some(provider_message_id.to_string());
        task.error = None;
        task.sent_at = Some(now);
        task.updated_at = now;
        Ok(true)
    }

    async fn mark_failed(&self, id: TaskId, error: &str) -> Result<bool> {
        let mut state = self.state()?;
        let Some(task) = state
            .tasks
            .iter_mut()
            .find(|t| t.id == id && t.status == TaskStatus::Sending)
        else {
            return Ok(false);
        };
        task.status = TaskStatus::Failed;
        task.error = Some(error.to_string());
        task.provider_message_id = None;
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn cancel_pending(&self, campaign_id: CampaignId) -> Result<u64> {
        let mut state = self.state()?;
        let now = Utc::now();
        let mut count = 0;
        for task in state
            .tasks
            .iter_mut()
            .filter(|t| t.campaign_id == campaign_id && t.status == TaskStatus::Pending)
        {
            task.status = TaskStatus::Cancelled;
            task.updated_at = now;
            count += 1;
        }
        Ok(count)
    }

    async fn reset_failed(&self, campaign_id: CampaignId) -> Result<u64> {
        let mut state = self.state()?;
        reset_where(&mut state, campaign_id, &[TaskStatus::Failed])
    }

    async fn reset_all(&self, campaign_id: CampaignId) -> Result<u64> {
        let mut state = self.state()?;
        reset_where(
            &mut state,
            campaign_id,
            &[TaskStatus::Failed, TaskStatus::Cancelled],
        )
    }

    async fn status_counts(&self, campaign_id: CampaignId) -> Result<TaskCounts> {
        let state = self.state()?;
        let mut counts = TaskCounts::default();
        for task in state.tasks.iter().filter(|t| t.campaign_id == campaign_id) {
            counts.add(task.status);
        }
        Ok(counts)
    }

    async fn list_by_campaign(
        &self,
        campaign_id: CampaignId,
        status: Option<TaskStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DispatchTask>> {
        let state = self.state()?;
        let mut tasks: Vec<DispatchTask> = state
            .tasks
            .iter()
            .filter(|t| t.campaign_id == campaign_id && status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.scheduled_time, t.position));

        Ok(tasks
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn list_stale_sending(
        &self,
        campaign_id: Option<CampaignId>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DispatchTask>> {
        let state = self.state()?;
        Ok(state
            .tasks
            .iter()
            .filter(|t| State::is_stale(t, campaign_id, cutoff))
            .cloned()
            .collect())
    }

    async fn fail_stale_sending(
        &self,
        campaign_id: Option<CampaignId>,
        cutoff: DateTime<Utc>,
        error: &str,
    ) -> Result<Vec<DispatchTask>> {
        let mut state = self.state()?;
        let now = Utc::now();
        let mut failed = Vec::new();
        for task in state
            .tasks
            .iter_mut()
            .filter(|t| State::is_stale(t, campaign_id, cutoff))
        {
            task.status = TaskStatus::Failed;
            task.error = Some(error.to_string());
            task.updated_at = now;
            failed.push(task.clone());
        }
        Ok(failed)
    }
}

fn reset_where(state: &mut State, campaign_id: CampaignId, from: &[TaskStatus]) -> Result<u64> {
    let now = Utc::now();
    let mut count = 0;
    for task in state
        .tasks
        .iter_mut()
        .filter(|t| t.campaign_id == campaign_id && from.contains(&t.status))
    {
        task.status = TaskStatus::Pending;
        task.error = None;
        task.provider_message_id = None;
        task.claimed_at = None;
        task.updated_at = now;
        count += 1;
    }
    Ok(count)
}
