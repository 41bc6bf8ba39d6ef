//! Dispatch metrics

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Prometheus metrics for campaign dispatch
pub struct DispatchMetrics {
    registry: Registry,
    messages: IntCounterVec,
    active_runs: IntGauge,
    orphaned: IntCounter,
}

impl DispatchMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let messages = IntCounterVec::new(
            Opts::new("wacast_messages_total", "Messages handed to the gateway by outcome"),
            &["outcome"],
        )?;
        let active_runs = IntGauge::new("wacast_active_runs", "Sender loops currently running")?;
        let orphaned = IntCounter::new(
            "wacast_orphaned_tasks_total",
            "Tasks found stuck in sending and reconciled",
        )?;

        registry.register(Box::new(messages.clone()))?;
        registry.register(Box::new(active_runs.clone()))?;
        registry.register(Box::new(orphaned.clone()))?;

        Ok(Self {
            registry,
            messages,
            active_runs,
            orphaned,
        })
    }

    pub fn record_sent(&self) {
        self.messages.with_label_values(&["sent"]).inc();
    }

    pub fn record_failed(&self) {
        self.messages.with_label_values(&["failed"]).inc();
    }

    pub fn run_started(&self) {
        self.active_runs.inc();
    }

    pub fn run_finished(&self) {
        self.active_runs.dec();
    }

    pub fn record_orphans(&self, count: usize) {
        self.orphaned.inc_by(count as u64);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_counts_outcomes() {
        let metrics = DispatchMetrics::new().unwrap();
        metrics.record_sent();
        metrics.record_sent();
        metrics.record_failed();
        metrics.record_orphans(3);

        let text = metrics.render().unwrap();
        assert!(text.contains("wacast_messages_total{outcome=\"sent\"} 2"));
        assert!(text.contains("wacast_messages_total{outcome=\"failed\"} 1"));
        assert!(text.contains("wacast_orphaned_tasks_total 3"));
        assert!(text.contains("wacast_active_runs 0"));
    }
}
