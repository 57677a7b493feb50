//! Prometheus metrics shared by gateway tasks.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

const NAMESPACE: &str = "smsgate";

/// Metrics handle constructed once at startup and threaded to every
/// component.
#[derive(Debug)]
pub struct CoreMetrics {
    registry: Registry,
    messages_accepted: IntCounter,
    messages_finalized: IntCounterVec,
    send_attempts: IntCounterVec,
    retries_scheduled: IntCounter,
    dlq_published: IntCounter,
    dlr_received: IntCounterVec,
    worker_queue_depth: IntGauge,
    provider_send_duration: Histogram,
}

impl CoreMetrics {
    /// Build and register the gateway metric set.
    pub fn new(agent_name: &str) -> prometheus::Result<Self> {
        let registry = Registry::new();

        let messages_accepted = IntCounter::with_opts(
            Opts::new("messages_accepted_total", "Messages accepted at intake")
                .namespace(NAMESPACE)
                .const_label("agent", agent_name),
        )?;
        let messages_finalized = IntCounterVec::new(
            Opts::new(
                "messages_finalized_total",
                "Messages that reached a terminal state",
            )
            .namespace(NAMESPACE)
            .const_label("agent", agent_name),
            &["status"],
        )?;
        let send_attempts = IntCounterVec::new(
            Opts::new("send_attempts_total", "Provider send attempts by outcome")
                .namespace(NAMESPACE)
                .const_label("agent", agent_name),
            &["outcome"],
        )?;
        let retries_scheduled = IntCounter::with_opts(
            Opts::new("retries_scheduled_total", "Delayed retry jobs scheduled")
                .namespace(NAMESPACE)
                .const_label("agent", agent_name),
        )?;
        let dlq_published = IntCounter::with_opts(
            Opts::new("dlq_published_total", "Jobs dead-lettered")
                .namespace(NAMESPACE)
                .const_label("agent", agent_name),
        )?;
        let dlr_received = IntCounterVec::new(
            Opts::new("dlr_received_total", "Delivery receipts ingested by status")
                .namespace(NAMESPACE)
                .const_label("agent", agent_name),
            &["status"],
        )?;
        let worker_queue_depth = IntGauge::with_opts(
            Opts::new("worker_queue_depth", "Jobs buffered in the dispatch channel")
                .namespace(NAMESPACE)
                .const_label("agent", agent_name),
        )?;
        let provider_send_duration = Histogram::with_opts(
            HistogramOpts::new(
                "provider_send_duration_seconds",
                "Wall time of provider send calls",
            )
            .namespace(NAMESPACE)
            .const_label("agent", agent_name)
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;

        registry.register(Box::new(messages_accepted.clone()))?;
        registry.register(Box::new(messages_finalized.clone()))?;
        registry.register(Box::new(send_attempts.clone()))?;
        registry.register(Box::new(retries_scheduled.clone()))?;
        registry.register(Box::new(dlq_published.clone()))?;
        registry.register(Box::new(dlr_received.clone()))?;
        registry.register(Box::new(worker_queue_depth.clone()))?;
        registry.register(Box::new(provider_send_duration.clone()))?;

        Ok(Self {
            registry,
            messages_accepted,
            messages_finalized,
            send_attempts,
            retries_scheduled,
            dlq_published,
            dlr_received,
            worker_queue_depth,
            provider_send_duration,
        })
    }

    /// Messages accepted at intake.
    pub fn messages_accepted(&self) -> &IntCounter {
        &self.messages_accepted
    }

    /// Terminal-state counter, labelled by status.
    pub fn messages_finalized(&self) -> &IntCounterVec {
        &self.messages_finalized
    }

    /// Send attempt counter, labelled by outcome.
    pub fn send_attempts(&self) -> &IntCounterVec {
        &self.send_attempts
    }

    /// Delayed retry jobs scheduled.
    pub fn retries_scheduled(&self) -> &IntCounter {
        &self.retries_scheduled
    }

    /// Dead-lettered jobs.
    pub fn dlq_published(&self) -> &IntCounter {
        &self.dlq_published
    }

    /// Ingested delivery receipts, labelled by status.
    pub fn dlr_received(&self) -> &IntCounterVec {
        &self.dlr_received
    }

    /// Depth of the dispatch channel.
    pub fn worker_queue_depth(&self) -> &IntGauge {
        &self.worker_queue_depth
    }

    /// Provider send latency histogram.
    pub fn provider_send_duration(&self) -> &Histogram {
        &self.provider_send_duration
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %err, "Failed to encode metrics");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registers_and_renders() {
        let metrics = CoreMetrics::new("test").unwrap();
        metrics.messages_accepted().inc();
        metrics
            .messages_finalized()
            .with_label_values(&["DELIVERED"])
            .inc();
        let rendered = metrics.render();
        assert!(rendered.contains("smsgate_messages_accepted_total"));
        assert!(rendered.contains("smsgate_messages_finalized_total"));
    }
}
