//! Dispatcher - campaign operations plus one background sender loop per
//! running campaign

use super::error::DispatchError;
use super::manager::{CampaignManager, CampaignProgress, CampaignSpec, ResetMode};
use super::metrics::DispatchMetrics;
use super::sender::{RunOutcome, SenderLoop};
use super::template::MessageRenderer;
use crate::gateway::SenderGateway;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wacast_common::types::{CampaignId, Paginated, TenantId};
use wacast_storage::models::{Campaign, CampaignStatus, DispatchTask, TaskStatus, UpdateCampaign};

type RunRegistry = Arc<Mutex<HashMap<CampaignId, Arc<Notify>>>>;

/// Result of an operation that may have spawned a sender loop
#[derive(Debug)]
pub struct Dispatch {
    pub campaign: Campaign,
    /// Present when this call started a new sender loop
    pub handle: Option<JoinHandle<()>>,
}

/// Entry point for everything that changes a campaign
pub struct Dispatcher {
    manager: Arc<CampaignManager>,
    sender: Arc<SenderLoop>,
    metrics: Arc<DispatchMetrics>,
    runs: RunRegistry,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        manager: Arc<CampaignManager>,
        gateway: Arc<dyn SenderGateway>,
        renderer: MessageRenderer,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        let sender = SenderLoop::new(manager.clone(), gateway, renderer, metrics.clone());
        Self {
            manager,
            sender: Arc::new(sender),
            metrics,
            runs: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn manager(&self) -> &Arc<CampaignManager> {
        &self.manager
    }

    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    /// Number of sender loops currently registered
    pub fn active_runs(&self) -> usize {
        lock_runs(&self.runs).len()
    }

    pub fn is_running(&self, id: CampaignId) -> bool {
        lock_runs(&self.runs).contains_key(&id)
    }

    pub async fn create(&self, tenant_id: TenantId, spec: CampaignSpec) -> Result<Campaign, DispatchError> {
        self.manager.create(tenant_id, spec).await
    }

    pub async fn get(&self, tenant_id: TenantId, id: CampaignId) -> Result<Campaign, DispatchError> {
        self.manager.get(tenant_id, id).await
    }

    pub async fn list(
        &self,
        tenant_id: TenantId,
        status: Option<CampaignStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Paginated<Campaign>, DispatchError> {
        self.manager.list(tenant_id, status, limit, offset).await
    }

    pub async fn update(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
        changes: UpdateCampaign,
    ) -> Result<Campaign, DispatchError> {
        self.manager.update(tenant_id, id, changes).await
    }

    pub async fn delete(&self, tenant_id: TenantId, id: CampaignId) -> Result<(), DispatchError> {
        self.manager.delete(tenant_id, id).await
    }

    /// Start (or schedule) a campaign and spawn its sender loop
    pub async fn start(&self, tenant_id: TenantId, id: CampaignId) -> Result<Dispatch, DispatchError> {
        let campaign = self.manager.start(tenant_id, id).await?;
        Ok(self.dispatch(campaign))
    }

    pub async fn resume(&self, tenant_id: TenantId, id: CampaignId) -> Result<Dispatch, DispatchError> {
        let campaign = self.manager.resume(tenant_id, id).await?;
        Ok(self.dispatch(campaign))
    }

    pub async fn pause(&self, tenant_id: TenantId, id: CampaignId) -> Result<Campaign, DispatchError> {
        let campaign = self.manager.pause(tenant_id, id).await?;
        self.wake(id);
        Ok(campaign)
    }

    pub async fn cancel(&self, tenant_id: TenantId, id: CampaignId) -> Result<Campaign, DispatchError> {
        let campaign = self.manager.cancel(tenant_id, id).await?;
        self.wake(id);
        Ok(campaign)
    }

    pub async fn reset(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
        mode: ResetMode,
    ) -> Result<Campaign, DispatchError> {
        let campaign = self.manager.reset(tenant_id, id, mode).await?;
        self.wake(id);
        Ok(campaign)
    }

    pub async fn status(&self, tenant_id: TenantId, id: CampaignId) -> Result<CampaignProgress, DispatchError> {
        self.manager.status(tenant_id, id).await
    }

    pub async fn list_tasks(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
        status: Option<TaskStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Paginated<DispatchTask>, DispatchError> {
        self.manager.list_tasks(tenant_id, id, status, limit, offset).await
    }

    /// Fail a campaign's orphaned tasks and restart its loop if it is still
    /// running without one
    pub async fn reconcile(
        &self,
        tenant_id: TenantId,
        id: CampaignId,
    ) -> Result<Vec<DispatchTask>, DispatchError> {
        let failed = self.manager.reconcile(tenant_id, id).await?;
        self.metrics.record_orphans(failed.len());

        let campaign = self.manager.campaign(id).await?;
        if campaign.status == CampaignStatus::Running {
            self.spawn_run(id);
        }
        Ok(failed)
    }

    /// Fail orphaned tasks across every campaign
    pub async fn reconcile_all(&self) -> Result<usize, DispatchError> {
        let failed = self.manager.reconcile_orphans(None).await?;
        self.metrics.record_orphans(failed.len());
        Ok(failed.len())
    }

    /// Start every scheduled campaign that is due. A due campaign whose
    /// audience is now empty goes back to `draft`.
    pub async fn start_due(&self, now: DateTime<Utc>) -> Result<Vec<CampaignId>, DispatchError> {
        let mut started = Vec::new();

        for campaign in self.manager.due_scheduled(now).await? {
            match self.manager.start_at(campaign.tenant_id, campaign.id, now).await {
                Ok(running) => {
                    self.dispatch(running);
                    started.push(campaign.id);
                }
                Err(DispatchError::EmptyAudience) => {
                    warn!(campaign_id = %campaign.id, "Scheduled campaign has no recipients, returning to draft");
                    if let Err(e) = self
                        .manager
                        .reset(campaign.tenant_id, campaign.id, ResetMode::All)
                        .await
                    {
                        error!(campaign_id = %campaign.id, "Failed to return campaign to draft: {}", e);
                    }
                }
                Err(e) => {
                    error!(campaign_id = %campaign.id, "Failed to start scheduled campaign: {}", e);
                }
            }
        }

        Ok(started)
    }

    /// Spawn loops for `running` campaigns that have none, e.g. after a restart
    pub async fn resume_active(&self) -> Result<usize, DispatchError> {
        let mut spawned = 0;
        for campaign in self.manager.running().await? {
            if self.spawn_run(campaign.id).is_some() {
                spawned += 1;
            }
        }
        if spawned > 0 {
            info!(spawned, "Resumed sender loops for running campaigns");
        }
        Ok(spawned)
    }

    /// Ask every loop to stop after its current send and wait for them
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        let drained = tokio::time::timeout(grace, async {
            while self.active_runs() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(remaining = self.active_runs(), "Sender loops still running at shutdown");
        } else {
            info!("All sender loops stopped");
        }
    }

    fn dispatch(&self, campaign: Campaign) -> Dispatch {
        let handle = if campaign.status == CampaignStatus::Running {
            self.spawn_run(campaign.id)
        } else {
            None
        };
        Dispatch { campaign, handle }
    }

    /// Wake a loop waiting out its rate limit so it re-reads the status
    pub fn wake(&self, id: CampaignId) {
        if let Some(wake) = lock_runs(&self.runs).get(&id) {
            wake.notify_one();
        }
    }

    /// Spawn a sender loop unless one is already registered for `id`
    pub fn spawn_run(&self, id: CampaignId) -> Option<JoinHandle<()>> {
        let wake = register(&self.runs, id)?;

        let sender = self.sender.clone();
        let manager = self.manager.clone();
        let metrics = self.metrics.clone();
        let runs = self.runs.clone();
        let shutdown = self.shutdown.clone();

        Some(tokio::spawn(async move {
            metrics.run_started();
            let mut wake = wake;

            loop {
                let outcome = sender.run(id, wake.clone(), shutdown.clone()).await;
                match &outcome {
                    Ok(outcome) => debug!(campaign_id = %id, ?outcome, "Sender loop finished"),
                    Err(e) => error!(campaign_id = %id, code = e.code(), "Sender loop failed: {}", e),
                }
                lock_runs(&runs).remove(&id);

                // a resume may have landed while this loop was on its way out
                let restart = matches!(outcome, Ok(RunOutcome::Paused) | Ok(RunOutcome::Stopped(_)))
                    && !shutdown.is_cancelled()
                    && matches!(
                        manager.campaign(id).await,
                        Ok(Campaign { status: CampaignStatus::Running, .. })
                    );
                if !restart {
                    break;
                }
                match register(&runs, id) {
                    Some(fresh) => wake = fresh,
                    None => break,
                }
            }

            metrics.run_finished();
        }))
    }
}

fn lock_runs(runs: &RunRegistry) -> MutexGuard<'_, HashMap<CampaignId, Arc<Notify>>> {
    runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn register(runs: &RunRegistry, id: CampaignId) -> Option<Arc<Notify>> {
    let mut runs = lock_runs(runs);
    if runs.contains_key(&id) {
        return None;
    }
    let wake = Arc::new(Notify::new());
    runs.insert(id, wake.clone());
    Some(wake)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayError, SendReceipt, SendRequest};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;
    use wacast_common::config::{DispatchConfig, MessagingConfig};
    use wacast_storage::models::{Contact, TargetingRule};
    use wacast_storage::{MemoryStore, Stores};

    #[derive(Clone, Copy)]
    enum Interrupt {
        Pause,
        Cancel,
    }

    /// Gateway that pauses or cancels its own campaign on the n-th send
    struct ScriptedGateway {
        manager: Arc<CampaignManager>,
        sends: AtomicUsize,
        script: Mutex<Option<(usize, Interrupt, TenantId, CampaignId)>>,
    }

    impl ScriptedGateway {
        fn new(manager: Arc<CampaignManager>) -> Self {
            Self {
                manager,
                sends: AtomicUsize::new(0),
                script: Mutex::new(None),
            }
        }

        fn interrupt_at(&self, n: usize, action: Interrupt, tenant: TenantId, id: CampaignId) {
            *self.script.lock().unwrap() = Some((n, action, tenant, id));
        }

        fn sends(&self) -> usize {
            self.sends.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SenderGateway for ScriptedGateway {
        async fn send(&self, request: &SendRequest) -> Result<SendReceipt, GatewayError> {
            let n = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
            let script = *self.script.lock().unwrap();
            if let Some((at, action, tenant, id)) = script {
                if at == n {
                    match action {
                        Interrupt::Pause => self.manager.pause(tenant, id).await.unwrap(),
                        Interrupt::Cancel => self.manager.cancel(tenant, id).await.unwrap(),
                    };
                }
            }
            Ok(SendReceipt {
                provider_message_id: format!("wamid-{}-{}", n, request.phone),
            })
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        dispatcher: Dispatcher,
        gateway: Arc<ScriptedGateway>,
        tenant: TenantId,
    }

    fn fixture(contacts: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let tenant = Uuid::new_v4();
        for i in 0..contacts {
            store
                .insert_contact(Contact {
                    id: Uuid::new_v4(),
                    tenant_id: tenant,
                    name: format!("Contact {}", i),
                    phone: format!("+97250000{:04}", i),
                    tags: Vec::new(),
                    group_ids: Vec::new(),
                    opt_out: false,
                    active: true,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                })
                .unwrap();
        }

        let manager = Arc::new(CampaignManager::new(
            &Stores::memory(store.clone()),
            DispatchConfig::default(),
        ));
        let gateway = Arc::new(ScriptedGateway::new(manager.clone()));
        let dispatcher = Dispatcher::new(
            manager,
            gateway.clone(),
            MessageRenderer::from_config(&MessagingConfig::default()),
            Arc::new(DispatchMetrics::new().unwrap()),
        );

        Fixture {
            store,
            dispatcher,
            gateway,
            tenant,
        }
    }

    /// Every recipient has an outcome exactly when the campaign is completed
    fn assert_counters_match_status(progress: &CampaignProgress) {
        let all_done = progress.sent_count + progress.failed_count == progress.total_recipients;
        assert_eq!(
            all_done,
            progress.status == CampaignStatus::Completed,
            "counters disagree with status: {:?}",
            progress
        );
    }

    fn spec(rate: f64) -> CampaignSpec {
        CampaignSpec {
            name: "Spring sale".to_string(),
            message_template: "Hi {{first_name}}".to_string(),
            targeting_rule: TargetingRule::All,
            send_rate_seconds: Some(rate),
            scheduled_for: None,
        }
    }

    #[tokio::test]
    async fn test_start_runs_to_completion() {
        let f = fixture(3);
        let campaign = f.dispatcher.create(f.tenant, spec(0.0)).await.unwrap();

        let dispatch = f.dispatcher.start(f.tenant, campaign.id).await.unwrap();
        assert_eq!(dispatch.campaign.status, CampaignStatus::Running);
        dispatch.handle.unwrap().await.unwrap();

        let progress = f.dispatcher.status(f.tenant, campaign.id).await.unwrap();
        assert_eq!(progress.status, CampaignStatus::Completed);
        assert_eq!(progress.sent_count, 3);
        assert_eq!(progress.progress_percent, 100.0);
        assert_counters_match_status(&progress);
        assert!(progress.estimated_completion.is_none());
        assert_eq!(f.dispatcher.active_runs(), 0);

        let text = f.dispatcher.metrics().render().unwrap();
        assert!(text.contains("wacast_messages_total{outcome=\"sent\"} 3"));
    }

    #[tokio::test]
    async fn test_cancel_mid_run_keeps_sent_and_cancels_rest() {
        let f = fixture(10);
        let campaign = f.dispatcher.create(f.tenant, spec(0.0)).await.unwrap();
        f.gateway
            .interrupt_at(3, Interrupt::Cancel, f.tenant, campaign.id);

        let dispatch = f.dispatcher.start(f.tenant, campaign.id).await.unwrap();
        dispatch.handle.unwrap().await.unwrap();

        assert_eq!(f.gateway.sends(), 3);
        let progress = f.dispatcher.status(f.tenant, campaign.id).await.unwrap();
        assert_eq!(progress.status, CampaignStatus::Cancelled);
        assert_eq!(progress.sent_count, 3);
        assert_eq!(progress.cancelled, 7);
        assert_eq!(progress.pending, 0);
        assert_counters_match_status(&progress);
    }

    #[tokio::test]
    async fn test_pause_then_resume_continues_where_it_left_off() {
        let f = fixture(5);
        let campaign = f.dispatcher.create(f.tenant, spec(0.0)).await.unwrap();
        f.gateway
            .interrupt_at(2, Interrupt::Pause, f.tenant, campaign.id);

        let dispatch = f.dispatcher.start(f.tenant, campaign.id).await.unwrap();
        dispatch.handle.unwrap().await.unwrap();

        let progress = f.dispatcher.status(f.tenant, campaign.id).await.unwrap();
        assert_eq!(progress.status, CampaignStatus::Paused);
        assert_eq!((progress.sent_count, progress.pending), (2, 3));
        assert_counters_match_status(&progress);

        let before = f
            .dispatcher
            .list_tasks(f.tenant, campaign.id, Some(TaskStatus::Sent), 10, 0)
            .await
            .unwrap();

        let resumed = f.dispatcher.resume(f.tenant, campaign.id).await.unwrap();
        resumed.handle.unwrap().await.unwrap();

        assert_eq!(f.gateway.sends(), 5);
        let progress = f.dispatcher.status(f.tenant, campaign.id).await.unwrap();
        assert_eq!(progress.status, CampaignStatus::Completed);
        assert_eq!(progress.sent_count, 5);
        assert_counters_match_status(&progress);

        let after = f
            .dispatcher
            .list_tasks(f.tenant, campaign.id, Some(TaskStatus::Sent), 10, 0)
            .await
            .unwrap();
        for task in &before.data {
            let same = after.data.iter().find(|t| t.id == task.id).unwrap();
            assert_eq!(same.sent_at, task.sent_at);
            assert_eq!(same.provider_message_id, task.provider_message_id);
        }
    }

    #[tokio::test]
    async fn test_pause_wakes_a_rate_limited_loop() {
        let f = fixture(2);
        let campaign = f.dispatcher.create(f.tenant, spec(60.0)).await.unwrap();
        let dispatch = f.dispatcher.start(f.tenant, campaign.id).await.unwrap();
        let handle = dispatch.handle.unwrap();

        while f.gateway.sends() < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.dispatcher.is_running(campaign.id));
        assert_eq!(f.dispatcher.resume_active().await.unwrap(), 0);

        f.dispatcher.pause(f.tenant, campaign.id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop should stop once woken")
            .unwrap();

        assert_eq!(f.gateway.sends(), 1);
        assert!(!f.dispatcher.is_running(campaign.id));
    }

    #[tokio::test]
    async fn test_shutdown_leaves_campaign_running_for_restart() {
        let f = fixture(2);
        let campaign = f.dispatcher.create(f.tenant, spec(60.0)).await.unwrap();
        f.dispatcher.start(f.tenant, campaign.id).await.unwrap();

        while f.gateway.sends() < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        f.dispatcher.shutdown(Duration::from_secs(5)).await;

        assert_eq!(f.dispatcher.active_runs(), 0);
        let campaign = f.dispatcher.get(f.tenant, campaign.id).await.unwrap();
        assert_eq!(campaign.status, CampaignStatus::Running);
        assert_eq!(campaign.sent_count, 1);
    }

    #[tokio::test]
    async fn test_reset_stops_an_in_flight_loop() {
        let f = fixture(2);
        let campaign = f.dispatcher.create(f.tenant, spec(60.0)).await.unwrap();
        let dispatch = f.dispatcher.start(f.tenant, campaign.id).await.unwrap();
        let handle = dispatch.handle.unwrap();

        while f.gateway.sends() < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let reset = f
            .dispatcher
            .reset(f.tenant, campaign.id, ResetMode::All)
            .await
            .unwrap();
        assert_eq!(reset.status, CampaignStatus::Draft);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reset should wake the loop")
            .unwrap();
        assert!(!f.dispatcher.is_running(campaign.id));
        assert_eq!(f.gateway.sends(), 1);

        let progress = f.dispatcher.status(f.tenant, campaign.id).await.unwrap();
        assert_eq!(progress.status, CampaignStatus::Draft);
        assert_eq!((progress.sent_count, progress.pending), (1, 1));
        assert!(progress.started_at.is_none());
        assert_counters_match_status(&progress);

        // starting again reuses the queue and only sends the remaining task
        let faster = UpdateCampaign {
            send_rate_seconds: Some(0.0),
            ..Default::default()
        };
        f.dispatcher.update(f.tenant, campaign.id, faster).await.unwrap();
        let restarted = f.dispatcher.start(f.tenant, campaign.id).await.unwrap();
        assert_eq!(restarted.campaign.total_recipients, 2);
        tokio::time::timeout(Duration::from_secs(5), restarted.handle.unwrap())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(f.gateway.sends(), 2);
        let progress = f.dispatcher.status(f.tenant, campaign.id).await.unwrap();
        assert_eq!(progress.status, CampaignStatus::Completed);
        assert_counters_match_status(&progress);
    }

    #[tokio::test]
    async fn test_late_outcome_does_not_overwrite_reconciled_task() {
        let f = fixture(1);
        let manager = f.dispatcher.manager().clone();
        let campaign = f.dispatcher.create(f.tenant, spec(0.0)).await.unwrap();
        manager.start(f.tenant, campaign.id).await.unwrap();

        let task = manager.queue().claim_next(campaign.id).await.unwrap().unwrap();
        f.store
            .set_claimed_at(task.id, Utc::now() - chrono::Duration::minutes(10))
            .unwrap();
        assert_eq!(f.dispatcher.reconcile_all().await.unwrap(), 1);

        assert!(!manager.queue().mark_sent(task.id, "wamid-late").await.unwrap());
        assert!(!manager.queue().mark_failed(task.id, "timeout").await.unwrap());

        let tasks = f
            .dispatcher
            .list_tasks(f.tenant, campaign.id, None, 10, 0)
            .await
            .unwrap();
        assert_eq!(tasks.data[0].status, TaskStatus::Failed);
        assert_eq!(tasks.data[0].provider_message_id, None);
        assert!(tasks.data[0].error.as_deref().unwrap().starts_with("orphaned"));

        let text = f.dispatcher.metrics().render().unwrap();
        assert!(text.contains("wacast_orphaned_tasks_total 1"));
        assert!(!text.contains("wacast_messages_total{outcome=\"sent\"} 1"));
    }

    #[tokio::test]
    async fn test_start_due_skips_future_campaigns() {
        let f = fixture(1);
        let later = f
            .dispatcher
            .create(
                f.tenant,
                CampaignSpec {
                    scheduled_for: Some(Utc::now() + chrono::Duration::hours(1)),
                    ..spec(0.0)
                },
            )
            .await
            .unwrap();

        let started = f.dispatcher.start_due(Utc::now()).await.unwrap();
        assert!(started.is_empty());

        let started = f
            .dispatcher
            .start_due(Utc::now() + chrono::Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(started, vec![later.id]);
    }
}
