//! Campaign state machine

use super::error::DispatchError;
use serde::{Deserialize, Serialize};
use wacast_storage::models::CampaignStatus;

/// Operations that move a campaign between statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignAction {
    Start,
    Schedule,
    Pause,
    Resume,
    Cancel,
    Complete,
    Reset,
}

impl std::fmt::Display for CampaignAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignAction::Start => write!(f, "start"),
            CampaignAction::Schedule => write!(f, "schedule"),
            CampaignAction::Pause => write!(f, "pause"),
            CampaignAction::Resume => write!(f, "resume"),
            CampaignAction::Cancel => write!(f, "cancel"),
            CampaignAction::Complete => write!(f, "complete"),
            CampaignAction::Reset => write!(f, "reset"),
        }
    }
}

/// Status reached by applying `action` in `from`, or `InvalidTransition`
pub fn next_status(
    from: CampaignStatus,
    action: CampaignAction,
) -> Result<CampaignStatus, DispatchError> {
    use CampaignAction as A;
    use CampaignStatus as S;

    match (from, action) {
        (S::Draft, A::Start) | (S::Scheduled, A::Start) => Ok(S::Running),
        (S::Draft, A::Schedule) => Ok(S::Scheduled),
        (S::Running, A::Pause) => Ok(S::Paused),
        (S::Running, A::Cancel) => Ok(S::Cancelled),
        (S::Paused, A::Resume) => Ok(S::Running),
        (S::Running, A::Complete) => Ok(S::Completed),
        (S::Draft | S::Scheduled | S::Running | S::Paused, A::Reset) => Ok(S::Draft),
        _ => Err(DispatchError::InvalidTransition { from, action }),
    }
}
