//! Dispatch errors

use super::state::CampaignAction;
use chrono::{DateTime, Utc};
use thiserror::Error;
use wacast_storage::models::CampaignStatus;

/// Campaign and queue level failures, surfaced to the caller
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Campaign not found")]
    NotFound,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Targeting rule resolved to no recipients")]
    EmptyAudience,

    #[error("Cannot {action} a campaign that is {from}")]
    InvalidTransition {
        from: CampaignStatus,
        action: CampaignAction,
    },

    #[error("Campaign is {status}, only drafts can be changed")]
    NotDraft { status: CampaignStatus },

    #[error("Campaign is scheduled for {scheduled_for}")]
    NotDue { scheduled_for: DateTime<Utc> },

    #[error("{count} task(s) stuck in sending need reconciliation")]
    OrphanedTask { count: usize },

    #[error("Persistence error: {0}")]
    Persistence(#[from] wacast_common::Error),
}

impl DispatchError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::NotFound => "NOT_FOUND",
            DispatchError::Validation(_) => "VALIDATION_ERROR",
            DispatchError::EmptyAudience => "EMPTY_AUDIENCE",
            DispatchError::InvalidTransition { .. } => "INVALID_TRANSITION",
            DispatchError::NotDraft { .. } => "NOT_DRAFT",
            DispatchError::NotDue { .. } => "NOT_DUE",
            DispatchError::OrphanedTask { .. } => "ORPHANED_TASK",
            DispatchError::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }
}
