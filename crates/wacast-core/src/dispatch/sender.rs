//! Sender Loop - drains one campaign's queue through the gateway

use super::error::DispatchError;
use super::manager::CampaignManager;
use super::metrics::DispatchMetrics;
use super::state::CampaignAction;
use super::template::MessageRenderer;
use crate::gateway::{SendRequest, SenderGateway};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use wacast_common::types::CampaignId;
use wacast_storage::models::{CampaignStatus, DispatchTask};

/// How a sender run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Queue drained; campaign is `completed`
    Completed { sent: i64, failed: i64 },
    Paused,
    /// Pending tasks were cancelled
    Cancelled,
    /// Process shutdown requested; the campaign stays `running`
    Interrupted,
    /// Campaign left `running` for some other reason
    Stopped(CampaignStatus),
    /// Another task is still in `sending`; nothing to do for now
    Deferred,
}

/// Rate-limited sender for a single campaign
pub struct SenderLoop {
    manager: Arc<CampaignManager>,
    gateway: Arc<dyn SenderGateway>,
    renderer: MessageRenderer,
    metrics: Arc<DispatchMetrics>,
}

impl SenderLoop {
    pub fn new(
        manager: Arc<CampaignManager>,
        gateway: Arc<dyn SenderGateway>,
        renderer: MessageRenderer,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            manager,
            gateway,
            renderer,
            metrics,
        }
    }

    /// Send until the queue is empty or the campaign stops running.
    ///
    /// The campaign status is re-read before every claim, so pause and
    /// cancel take effect after at most the send in flight. `wake` cuts a
    /// rate-limit wait short so a status change is noticed immediately.
    pub async fn run(
        &self,
        campaign_id: CampaignId,
        wake: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> Result<RunOutcome, DispatchError> {
        self.drain(campaign_id, wake, shutdown)
            .instrument(info_span!("campaign_run", %campaign_id))
            .await
    }

    async fn drain(
        &self,
        campaign_id: CampaignId,
        wake: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> Result<RunOutcome, DispatchError> {
        let reconciled = self.manager.prepare_run(campaign_id).await?;
        if reconciled > 0 {
            self.metrics.record_orphans(reconciled);
        }

        info!("Sender loop started");
        let mut next_send_at = Instant::now();

        loop {
            if shutdown.is_cancelled() {
                info!("Sender loop interrupted by shutdown");
                return Ok(RunOutcome::Interrupted);
            }

            let campaign = self.manager.campaign(campaign_id).await?;
            match campaign.status {
                CampaignStatus::Running => {}
                CampaignStatus::Cancelled => {
                    // cancel may have raced a claim that has since finished
                    self.manager.queue().cancel_pending(campaign_id).await?;
                    self.manager.refresh_counters(campaign_id).await?;
                    info!("Sender loop stopped: campaign cancelled");
                    return Ok(RunOutcome::Cancelled);
                }
                CampaignStatus::Paused => {
                    info!("Sender loop stopped: campaign paused");
                    return Ok(RunOutcome::Paused);
                }
                other => {
                    info!(status = %other, "Sender loop stopped");
                    return Ok(RunOutcome::Stopped(other));
                }
            }

            if Instant::now() < next_send_at {
                pause_until(next_send_at, &wake, &shutdown).await;
                continue;
            }

            let Some(task) = self.manager.queue().claim_next(campaign_id).await? else {
                return self.finish(campaign_id).await;
            };

            self.send(&task).await?;
            self.manager.refresh_counters(campaign_id).await?;

            next_send_at = Instant::now() + rate_interval(campaign.send_rate_seconds);
        }
    }

    async fn send(&self, task: &DispatchTask) -> Result<(), DispatchError> {
        let recipient = task.recipient();
        let request = SendRequest {
            message: self.renderer.render(&task.message_template, &recipient),
            phone: recipient.phone,
        };

        match self.gateway.send(&request).await {
            Ok(receipt) => {
                let recorded = self
                    .manager
                    .queue()
                    .mark_sent(task.id, &receipt.provider_message_id)
                    .await?;
                if !recorded {
                    warn!(
                        task_id = %task.id,
                        provider_message_id = %receipt.provider_message_id,
                        "Gateway accepted a task that is no longer sending"
                    );
                    return Ok(());
                }
                self.metrics.record_sent();
                debug!(
                    task_id = %task.id,
                    position = task.position,
                    provider_message_id = %receipt.provider_message_id,
                    "Message sent"
                );
            }
            Err(e) => {
                if !self.manager.queue().mark_failed(task.id, &e.to_string()).await? {
                    warn!(task_id = %task.id, "Send failed for a task that is no longer sending: {}", e);
                    return Ok(());
                }
                self.metrics.record_failed();
                warn!(task_id = %task.id, position = task.position, "Message failed: {}", e);
            }
        }
        Ok(())
    }

    async fn finish(&self, campaign_id: CampaignId) -> Result<RunOutcome, DispatchError> {
        let counts = self.manager.refresh_counters(campaign_id).await?;
        if counts.pending > 0 || counts.sending > 0 {
            debug!(sending = counts.sending, "Another send is in flight, deferring");
            return Ok(RunOutcome::Deferred);
        }

        let campaign = self.manager.campaign(campaign_id).await?;
        if campaign.status != CampaignStatus::Running {
            return Ok(RunOutcome::Stopped(campaign.status));
        }

        match self.manager.apply(&campaign, CampaignAction::Complete).await {
            Ok(_) => {
                info!(sent = counts.sent, failed = counts.failed, "Campaign completed");
                Ok(RunOutcome::Completed {
                    sent: counts.sent,
                    failed: counts.failed,
                })
            }
            // paused or cancelled between the last send and completion
            Err(DispatchError::InvalidTransition { from, .. }) => Ok(RunOutcome::Stopped(from)),
            Err(e) => Err(e),
        }
    }
}

fn rate_interval(send_rate_seconds: f64) -> Duration {
    Duration::try_from_secs_f64(send_rate_seconds).unwrap_or(Duration::ZERO)
}

async fn pause_until(deadline: Instant, wake: &Notify, shutdown: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep_until(deadline) => {}
        _ = wake.notified() => {}
        _ = shutdown.cancelled() => {}
    }
}
