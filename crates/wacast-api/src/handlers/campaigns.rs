//! Campaign handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use wacast_core::{CampaignProgress, CampaignSpec, ResetMode};
use wacast_storage::models::{
    Campaign, CampaignStatus, DispatchTask, TargetingRule, TaskStatus, UpdateCampaign,
};

use crate::error::{api_error, from_dispatch, ApiError};
use crate::state::AppState;

const MAX_PAGE_SIZE: i64 = 500;

/// Query parameters for paginated listings
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

impl ListQuery {
    fn page(&self) -> Result<(i64, i64), ApiError> {
        if self.limit < 1 || self.offset < 0 {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "limit must be positive and offset non-negative",
            ));
        }
        Ok((self.limit.min(MAX_PAGE_SIZE), self.offset))
    }

    fn status<T: std::str::FromStr<Err = String>>(&self) -> Result<Option<T>, ApiError> {
        self.status
            .as_deref()
            .map(|s| {
                s.parse::<T>()
                    .map_err(|e| api_error(StatusCode::BAD_REQUEST, "validation_error", e))
            })
            .transpose()
    }
}

/// Paginated list response
#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Campaign response
#[derive(Debug, Serialize, Deserialize)]
pub struct CampaignResponse {
    pub id: Uuid,
    pub name: String,
    pub message_template: String,
    pub targeting_rule: TargetingRule,
    pub send_rate_seconds: f64,
    pub status: CampaignStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub failed_count: i32,
    pub progress_percentage: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Campaign> for CampaignResponse {
    fn from(c: Campaign) -> Self {
        let progress = c.progress_percentage();
        Self {
            id: c.id,
            name: c.name,
            message_template: c.message_template,
            targeting_rule: c.targeting_rule,
            send_rate_seconds: c.send_rate_seconds,
            status: c.status,
            scheduled_for: c.scheduled_for,
            total_recipients: c.total_recipients,
            sent_count: c.sent_count,
            failed_count: c.failed_count,
            progress_percentage: progress,
            started_at: c.started_at,
            completed_at: c.completed_at,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

/// Per-recipient task response
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResponse {
    pub id: Uuid,
    pub position: i32,
    pub phone: String,
    pub display_name: String,
    pub status: TaskStatus,
    pub scheduled_time: DateTime<Utc>,
    pub attempts: i32,
    pub error: Option<String>,
    pub provider_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl From<DispatchTask> for TaskResponse {
    fn from(t: DispatchTask) -> Self {
        Self {
            id: t.id,
            position: t.position,
            phone: t.phone,
            display_name: t.display_name,
            status: t.status,
            scheduled_time: t.scheduled_time,
            attempts: t.attempts,
            error: t.error,
            provider_message_id: t.provider_message_id,
            sent_at: t.sent_at,
        }
    }
}

/// Request body for creating a campaign
#[derive(Debug, Deserialize)]
pub struct CreateCampaignRequest {
    pub name: String,
    pub message_template: String,
    pub targeting_rule: TargetingRule,
    pub send_rate_seconds: Option<f64>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Request body for updating a draft
#[derive(Debug, Deserialize)]
pub struct UpdateCampaignRequest {
    pub name: Option<String>,
    pub message_template: Option<String>,
    pub targeting_rule: Option<TargetingRule>,
    pub send_rate_seconds: Option<f64>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Request body for resetting a campaign
#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    #[serde(default = "default_reset_mode")]
    pub mode: ResetMode,
}

fn default_reset_mode() -> ResetMode {
    ResetMode::FailedOnly
}

/// Reconciliation result
#[derive(Debug, Serialize, Deserialize)]
pub struct ReconcileResponse {
    pub reconciled: usize,
    pub task_ids: Vec<Uuid>,
}

/// List campaigns for a tenant
///
/// GET /api/v1/tenants/:tenant_id/campaigns
pub async fn list_campaigns(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<CampaignResponse>>, ApiError> {
    let (limit, offset) = query.page()?;
    let status = query.status::<CampaignStatus>()?;

    let page = state
        .dispatcher
        .list(tenant_id, status, limit, offset)
        .await
        .map_err(|e| from_dispatch("Failed to list campaigns", e))?;

    Ok(Json(ListResponse {
        data: page.data.into_iter().map(CampaignResponse::from).collect(),
        total: page.total,
        limit: page.limit,
        offset: page.offset,
    }))
}

/// Create a new campaign
///
/// POST /api/v1/tenants/:tenant_id/campaigns
pub async fn create_campaign(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<Uuid>,
    Json(input): Json<CreateCampaignRequest>,
) -> Result<(StatusCode, Json<CampaignResponse>), ApiError> {
    let spec = CampaignSpec {
        name: input.name,
        message_template: input.message_template,
        targeting_rule: input.targeting_rule,
        send_rate_seconds: input.send_rate_seconds,
        scheduled_for: input.scheduled_for,
    };

    let campaign = state
        .dispatcher
        .create(tenant_id, spec)
        .await
        .map_err(|e| from_dispatch("Failed to create campaign", e))?;

    info!("Created campaign {} for tenant {}", campaign.id, tenant_id);

    Ok((StatusCode::CREATED, Json(CampaignResponse::from(campaign))))
}

/// Get a campaign by ID
///
/// GET /api/v1/tenants/:tenant_id/campaigns/:campaign_id
pub async fn get_campaign(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<CampaignResponse>, ApiError> {
    let campaign = state
        .dispatcher
        .get(tenant_id, campaign_id)
        .await
        .map_err(|e| from_dispatch("Failed to get campaign", e))?;

    Ok(Json(CampaignResponse::from(campaign)))
}

/// Update a draft campaign
///
/// PUT /api/v1/tenants/:tenant_id/campaigns/:campaign_id
pub async fn update_campaign(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
    Json(input): Json<UpdateCampaignRequest>,
) -> Result<Json<CampaignResponse>, ApiError> {
    let changes = UpdateCampaign {
        name: input.name,
        message_template: input.message_template,
        targeting_rule: input.targeting_rule,
        send_rate_seconds: input.send_rate_seconds,
        scheduled_for: input.scheduled_for,
    };

    let campaign = state
        .dispatcher
        .update(tenant_id, campaign_id, changes)
        .await
        .map_err(|e| from_dispatch("Failed to update campaign", e))?;

    Ok(Json(CampaignResponse::from(campaign)))
}

/// Delete a draft campaign
///
/// DELETE /api/v1/tenants/:tenant_id/campaigns/:campaign_id
pub async fn delete_campaign(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state
        .dispatcher
        .delete(tenant_id, campaign_id)
        .await
        .map_err(|e| from_dispatch("Failed to delete campaign", e))?;

    info!("Deleted campaign {} for tenant {}", campaign_id, tenant_id);

    Ok(StatusCode::NO_CONTENT)
}

/// Start (or schedule) a campaign
///
/// POST /api/v1/tenants/:tenant_id/campaigns/:campaign_id/start
pub async fn start_campaign(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<CampaignResponse>, ApiError> {
    let dispatch = state
        .dispatcher
        .start(tenant_id, campaign_id)
        .await
        .map_err(|e| from_dispatch("Failed to start campaign", e))?;

    Ok(Json(CampaignResponse::from(dispatch.campaign)))
}

/// Pause a running campaign
///
/// POST /api/v1/tenants/:tenant_id/campaigns/:campaign_id/pause
pub async fn pause_campaign(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<CampaignResponse>, ApiError> {
    let campaign = state
        .dispatcher
        .pause(tenant_id, campaign_id)
        .await
        .map_err(|e| from_dispatch("Failed to pause campaign", e))?;

    Ok(Json(CampaignResponse::from(campaign)))
}

/// Resume a paused campaign
///
/// POST /api/v1/tenants/:tenant_id/campaigns/:campaign_id/resume
pub async fn resume_campaign(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<CampaignResponse>, ApiError> {
    let dispatch = state
        .dispatcher
        .resume(tenant_id, campaign_id)
        .await
        .map_err(|e| from_dispatch("Failed to resume campaign", e))?;

    Ok(Json(CampaignResponse::from(dispatch.campaign)))
}

/// Cancel a running campaign
///
/// POST /api/v1/tenants/:tenant_id/campaigns/:campaign_id/cancel
pub async fn cancel_campaign(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<CampaignResponse>, ApiError> {
    let campaign = state
        .dispatcher
        .cancel(tenant_id, campaign_id)
        .await
        .map_err(|e| from_dispatch("Failed to cancel campaign", e))?;

    Ok(Json(CampaignResponse::from(campaign)))
}

/// Return a campaign to draft and requeue failed tasks
///
/// POST /api/v1/tenants/:tenant_id/campaigns/:campaign_id/reset
pub async fn reset_campaign(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
    body: Option<Json<ResetRequest>>,
) -> Result<Json<CampaignResponse>, ApiError> {
    let mode = body.map_or(ResetMode::FailedOnly, |Json(req)| req.mode);

    let campaign = state
        .dispatcher
        .reset(tenant_id, campaign_id, mode)
        .await
        .map_err(|e| from_dispatch("Failed to reset campaign", e))?;

    Ok(Json(CampaignResponse::from(campaign)))
}

/// Fail tasks stuck in sending
///
/// POST /api/v1/tenants/:tenant_id/campaigns/:campaign_id/reconcile
pub async fn reconcile_campaign(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ReconcileResponse>, ApiError> {
    let failed = state
        .dispatcher
        .reconcile(tenant_id, campaign_id)
        .await
        .map_err(|e| from_dispatch("Failed to reconcile campaign", e))?;

    Ok(Json(ReconcileResponse {
        reconciled: failed.len(),
        task_ids: failed.into_iter().map(|t| t.id).collect(),
    }))
}

/// Campaign progress
///
/// GET /api/v1/tenants/:tenant_id/campaigns/:campaign_id/status
pub async fn get_campaign_status(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<CampaignProgress>, ApiError> {
    let progress = state
        .dispatcher
        .status(tenant_id, campaign_id)
        .await
        .map_err(|e| from_dispatch("Failed to get campaign status", e))?;

    Ok(Json(progress))
}

/// Per-recipient dispatch tasks
///
/// GET /api/v1/tenants/:tenant_id/campaigns/:campaign_id/tasks
pub async fn list_campaign_tasks(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<TaskResponse>>, ApiError> {
    let (limit, offset) = query.page()?;
    let status = query.status::<TaskStatus>()?;

    let page = state
        .dispatcher
        .list_tasks(tenant_id, campaign_id, status, limit, offset)
        .await
        .map_err(|e| from_dispatch("Failed to list campaign tasks", e))?;

    Ok(Json(ListResponse {
        data: page.data.into_iter().map(TaskResponse::from).collect(),
        total: page.total,
        limit: page.limit,
        offset: page.offset,
    }))
}
