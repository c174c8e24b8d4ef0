//! Prometheus metrics for redmq
//!
//! Metrics are derived from broker [`Event`]s: attach a collector to an
//! [`EventBus`] with [`RedmqMetrics::spawn_collector`] and render the text
//! format with [`RedmqMetrics::gather`].

use crate::events::{Event, EventBus, InstanceKind};
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// redmq metrics collector
#[derive(Clone)]
pub struct RedmqMetrics {
    registry: Arc<Registry>,

    // Message counters
    messages_published_total: IntCounterVec,
    messages_acknowledged_total: IntCounterVec,
    messages_unacknowledged_total: IntCounterVec,
    messages_requeued_total: IntCounterVec,
    messages_delayed_total: IntCounterVec,
    messages_dead_lettered_total: IntCounterVec,

    // Instances
    instances_up: IntGaugeVec,
    instance_errors_total: IntCounterVec,
}

impl std::fmt::Debug for RedmqMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedmqMetrics").finish_non_exhaustive()
    }
}

impl RedmqMetrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let messages_published_total = IntCounterVec::new(
            Opts::new("redmq_messages_published_total", "Messages stored as pending or scheduled"),
            &["queue", "scheduled"],
        )?;

        let messages_acknowledged_total = IntCounterVec::new(
            Opts::new("redmq_messages_acknowledged_total", "Messages handled successfully"),
            &["queue"],
        )?;

        let messages_unacknowledged_total = IntCounterVec::new(
            Opts::new("redmq_messages_unacknowledged_total", "Messages not handled"),
            &["queue", "reason"],
        )?;

        let messages_requeued_total = IntCounterVec::new(
            Opts::new("redmq_messages_requeued_total", "Messages put back to pending"),
            &["queue"],
        )?;

        let messages_delayed_total = IntCounterVec::new(
            Opts::new("redmq_messages_delayed_total", "Messages delayed before a retry"),
            &["queue"],
        )?;

        let messages_dead_lettered_total = IntCounterVec::new(
            Opts::new("redmq_messages_dead_lettered_total", "Messages dead-lettered"),
            &["queue", "reason"],
        )?;

        let instances_up = IntGaugeVec::new(
            Opts::new("redmq_instances_up", "Producers and consumers currently up"),
            &["kind"],
        )?;

        let instance_errors_total = IntCounterVec::new(
            Opts::new("redmq_instance_errors_total", "Errors reported by producers and consumers"),
            &["kind"],
        )?;

        registry.register(Box::new(messages_published_total.clone()))?;
        registry.register(Box::new(messages_acknowledged_total.clone()))?;
        registry.register(Box::new(messages_unacknowledged_total.clone()))?;
        registry.register(Box::new(messages_requeued_total.clone()))?;
        registry.register(Box::new(messages_delayed_total.clone()))?;
        registry.register(Box::new(messages_dead_lettered_total.clone()))?;
        registry.register(Box::new(instances_up.clone()))?;
        registry.register(Box::new(instance_errors_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            messages_published_total,
            messages_acknowledged_total,
            messages_unacknowledged_total,
            messages_requeued_total,
            messages_delayed_total,
            messages_dead_lettered_total,
            instances_up,
            instance_errors_total,
        })
    }

    /// Fold one event into the metrics
    pub fn record_event(&self, event: &Event) {
        match event {
            Event::MessagePublished {
                queue, scheduled, ..
            } => {
                let scheduled = if *scheduled { "true" } else { "false" };
                self.messages_published_total
                    .with_label_values(&[&queue.id(), scheduled])
                    .inc();
            }
            Event::MessageAcknowledged { queue, .. } => {
                self.messages_acknowledged_total
                    .with_label_values(&[&queue.id()])
                    .inc();
            }
            Event::MessageUnacknowledged { queue, reason, .. } => {
                self.messages_unacknowledged_total
                    .with_label_values(&[&queue.id(), reason.as_str()])
                    .inc();
            }
            Event::MessageRequeued { queue, .. } => {
                self.messages_requeued_total
                    .with_label_values(&[&queue.id()])
                    .inc();
            }
            Event::MessageDelayed { queue, .. } => {
                self.messages_delayed_total
                    .with_label_values(&[&queue.id()])
                    .inc();
            }
            Event::MessageDeadLettered { queue, reason, .. } => {
                self.messages_dead_lettered_total
                    .with_label_values(&[&queue.id(), reason.as_str()])
                    .inc();
            }
            Event::Up { kind, .. } => self.instances_up.with_label_values(&[kind_label(*kind)]).inc(),
            Event::Down { kind, .. } => self.instances_up.with_label_values(&[kind_label(*kind)]).dec(),
            Event::Error { kind, .. } => {
                self.instance_errors_total
                    .with_label_values(&[kind_label(*kind)])
                    .inc();
            }
            _ => {}
        }
    }

    /// Record every event emitted on `bus` from now on
    ///
    /// Returns `None` when the bus is disabled. The task ends when every
    /// sender of the bus is gone.
    pub fn spawn_collector(&self, bus: &EventBus) -> Option<JoinHandle<()>> {
        let mut events = bus.subscribe()?;
        let metrics = self.clone();
        Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => metrics.record_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Metrics collector skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }

    /// Get the registry for custom metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Gather metrics in Prometheus text format
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode_to_string(&metric_families).unwrap_or_default()
    }
}

fn kind_label(kind: InstanceKind) -> &'static str {
    match kind {
        InstanceKind::Producer => "producer",
        InstanceKind::Consumer => "consumer",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBusConfig;
    use crate::message::{DeadLetterReason, UnacknowledgementReason};
    use crate::queue::QueueParams;

    fn orders() -> QueueParams {
        QueueParams::new("shop", "orders")
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = RedmqMetrics::new();
        assert!(metrics.is_ok());
    }

    #[test]
    fn test_record_published() {
        let metrics = RedmqMetrics::new().unwrap();
        metrics.record_event(&Event::MessagePublished {
            id: "m1".into(),
            queue: orders(),
            consumer_group: None,
            scheduled: false,
        });

        let output = metrics.gather();
        assert!(output.contains("redmq_messages_published_total"));
        assert!(output.contains("queue=\"orders@shop\""));
        assert!(output.contains("scheduled=\"false\""));
    }

    #[test]
    fn test_record_failures_by_reason() {
        let metrics = RedmqMetrics::new().unwrap();
        metrics.record_event(&Event::MessageUnacknowledged {
            id: "m1".into(),
            queue: orders(),
            consumer_group: None,
            consumer_id: "c1".into(),
            reason: UnacknowledgementReason::Timeout,
        });
        metrics.record_event(&Event::MessageDeadLettered {
            id: "m1".into(),
            queue: orders(),
            consumer_group: None,
            reason: DeadLetterReason::RetryThresholdExceeded,
        });

        let output = metrics.gather();
        assert!(output.contains("reason=\"timeout\""));
        assert!(output.contains("reason=\"retry_threshold_exceeded\""));
    }

    #[test]
    fn test_instances_up_gauge() {
        let metrics = RedmqMetrics::new().unwrap();
        let up = Event::Up {
            kind: InstanceKind::Consumer,
            id: "c1".into(),
        };
        metrics.record_event(&up);
        metrics.record_event(&up);
        metrics.record_event(&Event::Down {
            kind: InstanceKind::Consumer,
            id: "c1".into(),
        });
        assert!(metrics
            .gather()
            .contains("redmq_instances_up{kind=\"consumer\"} 1"));
    }

    #[tokio::test]
    async fn test_collector_follows_bus() {
        let bus = EventBus::new(&EventBusConfig::default());
        let metrics = RedmqMetrics::new().unwrap();
        let handle = metrics.spawn_collector(&bus).unwrap();

        bus.emit(Event::MessageAcknowledged {
            id: "m1".into(),
            queue: orders(),
            consumer_group: None,
            consumer_id: "c1".into(),
        });
        drop(bus);
        handle.await.unwrap();

        assert!(metrics.gather().contains("redmq_messages_acknowledged_total"));
    }

    #[test]
    fn test_collector_on_disabled_bus() {
        let metrics = RedmqMetrics::new().unwrap();
        assert!(metrics.spawn_collector(&EventBus::disabled()).is_none());
    }
}
