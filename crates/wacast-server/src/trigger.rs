//! Schedule trigger - starts due campaigns and keeps running ones attached
//! to a sender loop

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use wacast_common::config::OrphanPolicy;
use wacast_core::Dispatcher;

/// Periodic sweep over scheduled and running campaigns
pub struct ScheduleTrigger {
    dispatcher: Arc<Dispatcher>,
    poll: Duration,
    policy: OrphanPolicy,
}

impl ScheduleTrigger {
    pub fn new(dispatcher: Arc<Dispatcher>, poll: Duration, policy: OrphanPolicy) -> Self {
        Self {
            dispatcher,
            poll,
            policy,
        }
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(poll_secs = self.poll.as_secs(), "Schedule trigger started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            self.tick(Utc::now()).await;
        }

        info!("Schedule trigger stopped");
    }

    /// One sweep. Errors are logged and retried on the next tick.
    pub async fn tick(&self, now: DateTime<Utc>) {
        match self.dispatcher.start_due(now).await {
            Ok(started) if !started.is_empty() => {
                info!(count = started.len(), "Started scheduled campaigns")
            }
            Ok(_) => {}
            Err(e) => error!("Failed to start scheduled campaigns: {}", e),
        }

        if self.policy == OrphanPolicy::Fail {
            if let Err(e) = self.dispatcher.reconcile_all().await {
                error!("Failed to reconcile orphaned tasks: {}", e);
            }
        }

        match self.dispatcher.resume_active().await {
            Ok(spawned) => debug!(spawned, "Checked running campaigns"),
            Err(e) => error!("Failed to resume running campaigns: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;
    use wacast_common::config::{DispatchConfig, MessagingConfig};
    use wacast_core::{
        CampaignManager, CampaignSpec, DispatchMetrics, GatewayError, MessageRenderer, SendReceipt,
        SendRequest, SenderGateway,
    };
    use wacast_storage::models::{CampaignStatus, TargetingRule};
    use wacast_storage::{MemoryStore, Stores};

    struct AcceptAll;

    #[async_trait]
    impl SenderGateway for AcceptAll {
        async fn send(&self, _request: &SendRequest) -> Result<SendReceipt, GatewayError> {
            Ok(SendReceipt {
                provider_message_id: "wamid".to_string(),
            })
        }
    }

    fn dispatcher() -> Arc<Dispatcher> {
        let manager = Arc::new(CampaignManager::new(
            &Stores::memory(Arc::new(MemoryStore::new())),
            DispatchConfig::default(),
        ));
        Arc::new(Dispatcher::new(
            manager,
            Arc::new(AcceptAll),
            MessageRenderer::from_config(&MessagingConfig::default()),
            Arc::new(DispatchMetrics::new().unwrap()),
        ))
    }

    #[tokio::test]
    async fn test_tick_starts_due_campaigns_only() {
        let dispatcher = dispatcher();
        let tenant = Uuid::new_v4();
        let at = Utc::now() + chrono::Duration::minutes(30);
        let campaign = dispatcher
            .create(
                tenant,
                CampaignSpec {
                    name: "Reminder".to_string(),
                    message_template: "See you soon".to_string(),
                    targeting_rule: TargetingRule::Manual {
                        numbers: vec!["0501234567".to_string()],
                    },
                    send_rate_seconds: Some(0.0),
                    scheduled_for: Some(at),
                },
            )
            .await
            .unwrap();

        let trigger = ScheduleTrigger::new(dispatcher.clone(), Duration::from_secs(30), OrphanPolicy::Fail);

        trigger.tick(Utc::now()).await;
        let current = dispatcher.get(tenant, campaign.id).await.unwrap();
        assert_eq!(current.status, CampaignStatus::Scheduled);

        trigger.tick(at + chrono::Duration::seconds(1)).await;
        let current = dispatcher.get(tenant, campaign.id).await.unwrap();
        assert!(matches!(
            current.status,
            CampaignStatus::Running | CampaignStatus::Completed
        ));
        assert_eq!(current.total_recipients, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let trigger = ScheduleTrigger::new(dispatcher(), Duration::from_millis(10), OrphanPolicy::Manual);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), trigger.run(shutdown))
            .await
            .unwrap();
    }
}
