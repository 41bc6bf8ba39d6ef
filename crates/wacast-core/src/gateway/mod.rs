//! Sender gateway - the external API that delivers one WhatsApp message

mod green_api;

pub use green_api::GreenApiGateway;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wacast_common::types::PhoneNumber;

/// Gateway errors, recorded on the task and never fatal to a run
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Gateway not configured: {0}")]
    NotConfigured(String),

    #[error("Gateway request failed: {0}")]
    Transport(String),

    #[error("Gateway rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid gateway response: {0}")]
    InvalidResponse(String),
}

/// One outbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Digits-only `{countryCode}{localNumber}`
    pub phone: PhoneNumber,
    pub message: String,
}

/// Gateway acceptance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub provider_message_id: String,
}

/// Message-sending gateway
#[async_trait]
pub trait SenderGateway: Send + Sync {
    /// Submit one message. `Ok` means the gateway accepted it.
    async fn send(&self, request: &SendRequest) -> Result<SendReceipt, GatewayError>;
}
