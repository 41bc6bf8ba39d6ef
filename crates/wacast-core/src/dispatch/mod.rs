//! Campaign dispatch
//!
//! Campaigns move through a small state machine. Starting one resolves its
//! targeting rule into a persisted queue of per-recipient tasks, which a
//! sender loop drains one message at a time at the campaign's send rate.

mod audience;
mod dispatcher;
mod error;
mod manager;
mod metrics;
mod queue;
mod sender;
mod state;
mod template;

pub use audience::{validate_rule, AudienceResolver};
pub use dispatcher::{Dispatch, Dispatcher};
pub use error::DispatchError;
pub use manager::{CampaignManager, CampaignProgress, CampaignSpec, ResetMode};
pub use metrics::DispatchMetrics;
pub use queue::DispatchQueue;
pub use sender::{RunOutcome, SenderLoop};
pub use state::{next_status, CampaignAction};
pub use template::MessageRenderer;
