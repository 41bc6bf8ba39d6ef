//! API routes

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::handlers::{campaigns, health, metrics};
use crate::state::AppState;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    // Health check routes
    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/live", get(health::liveness))
        .route("/ready", get(health::readiness));

    // Campaign routes
    let campaign_routes = Router::new()
        .route(
            "/",
            get(campaigns::list_campaigns).post(campaigns::create_campaign),
        )
        .route(
            "/:campaign_id",
            get(campaigns::get_campaign)
                .put(campaigns::update_campaign)
                .delete(campaigns::delete_campaign),
        )
        .route("/:campaign_id/start", post(campaigns::start_campaign))
        .route("/:campaign_id/pause", post(campaigns::pause_campaign))
        .route("/:campaign_id/resume", post(campaigns::resume_campaign))
        .route("/:campaign_id/cancel", post(campaigns::cancel_campaign))
        .route("/:campaign_id/reset", post(campaigns::reset_campaign))
        .route("/:campaign_id/reconcile", post(campaigns::reconcile_campaign))
        .route("/:campaign_id/status", get(campaigns::get_campaign_status))
        .route("/:campaign_id/tasks", get(campaigns::list_campaign_tasks));

    let api_v1 = Router::new().nest("/tenants/:tenant_id/campaigns", campaign_routes);

    Router::new()
        .nest("/health", health_routes)
        .route("/metrics", get(metrics::metrics))
        .nest("/api/v1", api_v1)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorResponse;
    use crate::handlers::campaigns::{CampaignResponse, ListResponse, TaskResponse};
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;
    use wacast_common::config::{DispatchConfig, MessagingConfig};
    use wacast_core::{
        CampaignManager, CampaignProgress, DispatchMetrics, Dispatcher, GatewayError,
        MessageRenderer, SendReceipt, SendRequest, SenderGateway,
    };
    use wacast_storage::models::{CampaignStatus, Contact, TaskStatus};
    use wacast_storage::{MemoryStore, Stores};

    struct AcceptAll;

    #[async_trait]
    impl SenderGateway for AcceptAll {
        async fn send(&self, request: &SendRequest) -> Result<SendReceipt, GatewayError> {
            Ok(SendReceipt {
                provider_message_id: format!("wamid-{}", request.phone),
            })
        }
    }

    fn server(store: Arc<MemoryStore>) -> TestServer {
        let manager = Arc::new(CampaignManager::new(
            &Stores::memory(store),
            DispatchConfig::default(),
        ));
        let dispatcher = Dispatcher::new(
            manager,
            Arc::new(AcceptAll),
            MessageRenderer::from_config(&MessagingConfig::default()),
            Arc::new(DispatchMetrics::new().unwrap()),
        );
        let state = AppState {
            dispatcher: Arc::new(dispatcher),
            db_pool: None,
        };
        TestServer::new(create_router(state)).unwrap()
    }

    fn add_contact(store: &MemoryStore, tenant: Uuid, name: &str, phone: &str) {
        store
            .insert_contact(Contact {
                id: Uuid::new_v4(),
                tenant_id: tenant,
                name: name.to_string(),
                phone: phone.to_string(),
                tags: vec!["customers".to_string()],
                group_ids: Vec::new(),
                opt_out: false,
                active: true,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .unwrap();
    }

    fn campaigns_url(tenant: Uuid) -> String {
        format!("/api/v1/tenants/{}/campaigns", tenant)
    }

    fn new_campaign() -> serde_json::Value {
        json!({
            "name": "Holiday greeting",
            "message_template": "Hi {{first_name}}",
            "targeting_rule": {"kind": "tags", "tags": ["customers"]},
            "send_rate_seconds": 0.0
        })
    }

    async fn create(server: &TestServer, tenant: Uuid) -> CampaignResponse {
        let response = server.post(&campaigns_url(tenant)).json(&new_campaign()).await;
        response.assert_status(StatusCode::CREATED);
        response.json::<CampaignResponse>()
    }

    #[tokio::test]
    async fn test_create_get_and_list() {
        let server = server(Arc::new(MemoryStore::new()));
        let tenant = Uuid::new_v4();

        let created = create(&server, tenant).await;
        assert_eq!(created.status, CampaignStatus::Draft);
        assert_eq!(created.send_rate_seconds, 0.0);

        let fetched = server
            .get(&format!("{}/{}", campaigns_url(tenant), created.id))
            .await
            .json::<CampaignResponse>();
        assert_eq!(fetched.name, "Holiday greeting");

        let list = server
            .get(&campaigns_url(tenant))
            .add_query_param("status", "draft")
            .await
            .json::<ListResponse<CampaignResponse>>();
        assert_eq!(list.total, 1);
        assert_eq!(list.limit, 50);

        let response = server
            .get(&campaigns_url(tenant))
            .add_query_param("status", "sending")
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let server = server(Arc::new(MemoryStore::new()));
        let created = create(&server, Uuid::new_v4()).await;

        let response = server
            .get(&format!("{}/{}", campaigns_url(Uuid::new_v4()), created.id))
            .await;
        response.assert_status(StatusCode::NOT_FOUND);
        assert_eq!(response.json::<ErrorResponse>().error, "not_found");
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected() {
        let server = server(Arc::new(MemoryStore::new()));
        let response = server
            .post(&campaigns_url(Uuid::new_v4()))
            .json(&json!({
                "name": "Bad rate",
                "message_template": "Hi",
                "targeting_rule": {"kind": "all"},
                "send_rate_seconds": -2
            }))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(response.json::<ErrorResponse>().error, "validation_error");
    }

    #[tokio::test]
    async fn test_start_with_empty_audience() {
        let server = server(Arc::new(MemoryStore::new()));
        let tenant = Uuid::new_v4();
        let created = create(&server, tenant).await;

        let response = server
            .post(&format!("{}/{}/start", campaigns_url(tenant), created.id))
            .await;
        response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response.json::<ErrorResponse>().error, "empty_audience");

        let fetched = server
            .get(&format!("{}/{}", campaigns_url(tenant), created.id))
            .await
            .json::<CampaignResponse>();
        assert_eq!(fetched.status, CampaignStatus::Draft);
    }

    #[tokio::test]
    async fn test_illegal_transition_conflicts() {
        let server = server(Arc::new(MemoryStore::new()));
        let tenant = Uuid::new_v4();
        let created = create(&server, tenant).await;

        let response = server
            .post(&format!("{}/{}/pause", campaigns_url(tenant), created.id))
            .await;
        response.assert_status(StatusCode::CONFLICT);

        let body = response.json::<ErrorResponse>();
        assert_eq!(body.error, "invalid_transition");
        assert_eq!(body.message, "Cannot pause a campaign that is draft");
    }

    #[tokio::test]
    async fn test_campaign_runs_to_completion() {
        let store = Arc::new(MemoryStore::new());
        let tenant = Uuid::new_v4();
        add_contact(&store, tenant, "Dana Levi", "050-123-4567");
        add_contact(&store, tenant, "Noa Cohen", "+972 50 234 5678");
        add_contact(&store, tenant, "Omer Katz", "0503456789");
        let server = server(store);

        let created = create(&server, tenant).await;
        let url = format!("{}/{}", campaigns_url(tenant), created.id);

        let started = server
            .post(&format!("{}/start", url))
            .await
            .json::<CampaignResponse>();
        assert_eq!(started.status, CampaignStatus::Running);
        assert_eq!(started.total_recipients, 3);

        let mut progress = server
            .get(&format!("{}/status", url))
            .await
            .json::<CampaignProgress>();
        for _ in 0..100 {
            if progress.status == CampaignStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            progress = server
                .get(&format!("{}/status", url))
                .await
                .json::<CampaignProgress>();
        }
        assert_eq!(progress.status, CampaignStatus::Completed);
        assert_eq!(progress.sent_count, 3);

        let tasks = server
            .get(&format!("{}/tasks", url))
            .add_query_param("status", "sent")
            .await
            .json::<ListResponse<TaskResponse>>();
        assert_eq!(tasks.total, 3);
        assert_eq!(tasks.data[0].phone, "972501234567");
        assert!(tasks.data.iter().all(|t| t.status == TaskStatus::Sent));

        let metrics = server.get("/metrics").await.text();
        assert!(metrics.contains("wacast_messages_total{outcome=\"sent\"} 3"));
    }

    #[tokio::test]
    async fn test_delete_and_reset_draft() {
        let server = server(Arc::new(MemoryStore::new()));
        let tenant = Uuid::new_v4();
        let created = create(&server, tenant).await;
        let url = format!("{}/{}", campaigns_url(tenant), created.id);

        let reset = server
            .post(&format!("{}/reset", url))
            .json(&json!({"mode": "all"}))
            .await;
        reset.assert_status_ok();

        server.delete(&url).await.assert_status(StatusCode::NO_CONTENT);
        server.get(&url).await.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health() {
        let server = server(Arc::new(MemoryStore::new()));
        let response = server.get("/health").await;
        response.assert_status_ok();

        let body = response.json::<serde_json::Value>();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["active_runs"], 0);

        server.get("/health/ready").await.assert_status_ok();
    }
}
