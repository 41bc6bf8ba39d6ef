//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeSet;
use wacast_common::types::{CampaignId, ContactId, GroupId, PhoneNumber, TaskId, TenantId};

// ============================================================================
// Contacts
// ============================================================================

/// Contact model, owned by the admin console and read-only here
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub tenant_id: TenantId,
    pub name: String,
    pub phone: String,
    pub tags: Vec<String>,
    pub group_ids: Vec<GroupId>,
    pub opt_out: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// Whether the contact may receive campaign messages at all
    pub fn is_reachable(&self) -> bool {
        self.active && !self.opt_out
    }
}

/// Contact query used by the audience resolver
#[derive(Debug, Clone, Default)]
pub struct ContactFilter {
    /// Match contacts carrying any of these tags
    pub tags: Option<Vec<String>>,
    /// Match contacts in any of these groups
    pub group_ids: Option<Vec<GroupId>>,
    /// Match contacts with these ids
    pub ids: Option<Vec<ContactId>>,
    pub active_only: bool,
    pub exclude_opt_out: bool,
}

impl ContactFilter {
    /// Whether a contact satisfies every criterion of the filter
    pub fn matches(&self, contact: &Contact) -> bool {
        if self.active_only && !contact.active {
            return false;
        }
        if self.exclude_opt_out && contact.opt_out {
            return false;
        }
        if let Some(tags) = &self.tags {
            if !contact.tags.iter().any(|t| tags.contains(t)) {
                return false;
            }
        }
        if let Some(groups) = &self.group_ids {
            if !contact.group_ids.iter().any(|g| groups.contains(g)) {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&contact.id) {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// Campaigns
// ============================================================================

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    /// Completed and cancelled campaigns never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Cancelled)
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignStatus::Draft => write!(f, "draft"),
            CampaignStatus::Scheduled => write!(f, "scheduled"),
            CampaignStatus::Running => write!(f, "running"),
            CampaignStatus::Paused => write!(f, "paused"),
            CampaignStatus::Completed => write!(f, "completed"),
            CampaignStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "running" => Ok(CampaignStatus::Running),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            _ => Err(format!("Invalid campaign status: {}", s)),
        }
    }
}

impl TryFrom<String> for CampaignStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Which contacts a campaign should reach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetingRule {
    /// Every reachable contact of the tenant
    All,
    /// Contacts carrying any of the tags
    Tags { tags: BTreeSet<String> },
    /// Contacts in any of the groups
    Groups { groups: BTreeSet<GroupId> },
    /// Hand-picked contacts
    Explicit { contact_ids: BTreeSet<ContactId> },
    /// Raw phone numbers that bypass the contact store
    Manual { numbers: Vec<String> },
}

impl TargetingRule {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            TargetingRule::All => "all",
            TargetingRule::Tags { .. } => "tags",
            TargetingRule::Groups { .. } => "groups",
            TargetingRule::Explicit { .. } => "explicit",
            TargetingRule::Manual { .. } => "manual",
        }
    }
}

/// Campaign model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub tenant_id: TenantId,
    pub name: String,
    pub message_template: String,
    #[sqlx(json)]
    pub targeting_rule: TargetingRule,
    pub send_rate_seconds: f64,
    #[sqlx(try_from = "String")]
    pub status: CampaignStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub failed_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    /// Share of recipients with a final outcome, in percent
    pub fn progress_percentage(&self) -> f64 {
        if self.total_recipients == 0 {
            0.0
        } else {
            ((self.sent_count + self.failed_count) as f64 / self.total_recipients as f64) * 100.0
        }
    }

    /// Whether a schedule is set and still ahead of `now`
    pub fn is_scheduled_after(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.map_or(false, |at| at > now)
    }
}

/// Create campaign input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCampaign {
    pub tenant_id: TenantId,
    pub name: String,
    pub message_template: String,
    pub targeting_rule: TargetingRule,
    pub send_rate_seconds: f64,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub status: CampaignStatus,
}

/// Update campaign input, only applied to drafts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateCampaign {
    pub name: Option<String>,
    pub message_template: Option<String>,
    pub targeting_rule: Option<TargetingRule>,
    pub send_rate_seconds: Option<f64>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

// ============================================================================
// Dispatch tasks
// ============================================================================

/// Dispatch task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Sending => write!(f, "sending"),
            TaskStatus::Sent => write!(f, "sent"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "sending" => Ok(TaskStatus::Sending),
            "sent" => Ok(TaskStatus::Sent),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

impl TryFrom<String> for TaskStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A resolved recipient: who receives the message and how to address them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub phone: PhoneNumber,
    pub display_name: String,
}

/// One recipient's send attempt within a campaign
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DispatchTask {
    pub id: TaskId,
    pub campaign_id: CampaignId,
    /// Enqueue order, breaks ties on `scheduled_time`
    pub position: i32,
    pub phone: String,
    pub display_name: String,
    pub message_template: String,
    #[sqlx(try_from = "String")]
    pub status: TaskStatus,
    pub scheduled_time: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub error: Option<String>,
    pub provider_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DispatchTask {
    /// Recipient snapshot frozen at enqueue time
    pub fn recipient(&self) -> Recipient {
        Recipient {
            phone: PhoneNumber::from_normalized(self.phone.clone()),
            display_name: self.display_name.clone(),
        }
    }
}

/// Create dispatch task input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDispatchTask {
    pub campaign_id: CampaignId,
    pub position: i32,
    pub recipient: Recipient,
    pub message_template: String,
    pub scheduled_time: DateTime<Utc>,
}

/// Campaign task counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: i64,
    pub sending: i64,
    pub sent: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl TaskCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.sending + self.sent + self.failed + self.cancelled
    }

    /// Tasks with a final outcome
    pub fn terminal(&self) -> i64 {
        self.sent + self.failed + self.cancelled
    }

    pub(crate) fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Sending => self.sending += 1,
            TaskStatus::Sent => self.sent += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }
}
