//! Green-API WhatsApp gateway client

use super::{GatewayError, SendReceipt, SendRequest, SenderGateway};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use wacast_common::config::GatewayConfig;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody<'a> {
    chat_id: String,
    message: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageResponse {
    id_message: Option<String>,
}

/// HTTP client for a Green-API instance
pub struct GreenApiGateway {
    client: Client,
    api_url: String,
    instance_id: String,
    api_token: String,
}

impl GreenApiGateway {
    /// Create a client from configuration. Instance id and token are required.
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let instance_id = config
            .instance_id
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| GatewayError::NotConfigured("gateway.instance_id is required".to_string()))?;
        let api_token = config
            .api_token
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| GatewayError::NotConfigured("gateway.api_token is required".to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::NotConfigured(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            instance_id,
            api_token,
        })
    }

    fn send_url(&self) -> String {
        format!(
            "{}/waInstance{}/sendMessage/{}",
            self.api_url, self.instance_id, self.api_token
        )
    }
}

#[async_trait]
impl SenderGateway for GreenApiGateway {
    async fn send(&self, request: &SendRequest) -> Result<SendReceipt, GatewayError> {
        let body = SendMessageBody {
            chat_id: format!("{}@c.us", request.phone),
            message: &request.message,
        };

        let response = self
            .client
            .post(self.send_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|e| {
                warn!("Failed to read gateway error body: {}", e);
                String::new()
            });
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: SendMessageResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.without_url().to_string()))?;

        let provider_message_id = parsed
            .id_message
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GatewayError::InvalidResponse("missing idMessage".to_string()))?;

        debug!(phone = %request.phone, %provider_message_id, "Gateway accepted message");

        Ok(SendReceipt {
            provider_message_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wacast_common::types::PhoneNumber;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(api_url: String) -> GatewayConfig {
        GatewayConfig {
            api_url,
            instance_id: Some("1101000001".to_string()),
            api_token: Some("secret-token".to_string()),
            timeout_secs: 5,
        }
    }

    fn request() -> SendRequest {
        SendRequest {
            phone: PhoneNumber::from_normalized("972501234567"),
            message: "Hi Dana".to_string(),
        }
    }

    #[tokio::test]
    async fn test_send_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/waInstance1101000001/sendMessage/secret-token"))
            .and(body_json(serde_json::json!({
                "chatId": "972501234567@c.us",
                "message": "Hi Dana"
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"idMessage": "BAE5F4886F6F2D05"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let gateway = GreenApiGateway::new(&config(server.uri())).unwrap();
        let receipt = gateway.send(&request()).await.unwrap();

        assert_eq!(receipt.provider_message_id, "BAE5F4886F6F2D05");
    }

    #[tokio::test]
    async fn test_send_rejected_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(466).set_body_string("quota exceeded"))
            .mount(&server)
            .await;

        let gateway = GreenApiGateway::new(&config(server.uri())).unwrap();
        let err = gateway.send(&request()).await.unwrap_err();

        match err {
            GatewayError::Rejected { status, body } => {
                assert_eq!(status, 466);
                assert_eq!(body, "quota exceeded");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_missing_message_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let gateway = GreenApiGateway::new(&config(server.uri())).unwrap();
        let err = gateway.send(&request()).await.unwrap_err();

        assert!(matches!(err, GatewayError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_transport_error_hides_token() {
        // nothing listens on port 1
        let gateway = GreenApiGateway::new(&config("http://127.0.0.1:1".to_string())).unwrap();
        let err = gateway.send(&request()).await.unwrap_err();

        assert!(matches!(err, GatewayError::Transport(_)));
        let text = err.to_string();
        assert!(!text.contains("secret-token"), "token leaked: {}", text);
        assert!(!text.contains("sendMessage"), "url leaked: {}", text);
    }

    #[tokio::test]
    async fn test_timeout_error_hides_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"idMessage": "late"}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let mut cfg = config(server.uri());
        cfg.timeout_secs = 1;
        let gateway = GreenApiGateway::new(&cfg).unwrap();
        let err = gateway.send(&request()).await.unwrap_err();

        assert!(matches!(err, GatewayError::Transport(_)));
        assert!(!err.to_string().contains("secret-token"));
    }

    #[test]
    fn test_requires_credentials() {
        let mut cfg = config("http://localhost".to_string());
        cfg.api_token = None;
        assert!(matches!(
            GreenApiGateway::new(&cfg),
            Err(GatewayError::NotConfigured(_))
        ));
    }
}
