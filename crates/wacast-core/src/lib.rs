//! wacast Core - Campaign dispatch
//!
//! This crate turns a campaign definition into per-recipient dispatch tasks
//! and drains them through a rate-limited, resumable sender loop against an
//! external WhatsApp gateway.

pub mod dispatch;
pub mod gateway;

pub use dispatch::{
    next_status, AudienceResolver, CampaignAction, CampaignManager, CampaignProgress,
    CampaignSpec, Dispatch, DispatchError, DispatchMetrics, DispatchQueue, Dispatcher,
    MessageRenderer, ResetMode, RunOutcome, SenderLoop,
};
pub use gateway::{GatewayError, GreenApiGateway, SendReceipt, SendRequest, SenderGateway};
