//! Producer
//!
//! Resolves a message's destination, expands it into one envelope per
//! destination queue (and per consumer group of PUB_SUB queues) and stores
//! each envelope through the lifecycle engine.
//!
//! # Examples
//!
//! ```rust,no_run
//! use redmq::{Context, Producer, RedmqConfig};
//! use redmq::message::ProducibleMessage;
//! use redmq::queue::QueueParams;
//!
//! # async fn example() -> redmq::Result<()> {
//! let ctx = Context::connect(RedmqConfig::default()).await?;
//! let producer = Producer::new(ctx);
//! producer.run().await?;
//!
//! let message = ProducibleMessage::builder()
//!     .queue(QueueParams::new("shop", "orders"))
//!     .body(&"order #1")?
//!     .build()?;
//! let ids = producer.produce(&message).await?;
//! assert_eq!(ids.len(), 1);
//!
//! producer.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::context::Context;
use crate::events::{Event, InstanceKind};
use crate::exchange::ExchangeRouter;
use crate::message::{MessageDestination, MessageEnvelope, MessageLifecycle, ProducibleMessage};
use crate::power_switch::PowerSwitch;
use crate::queue::{ConsumerGroups, QueueManager, QueueParams, QueueType};
use crate::storage::now_millis;
use crate::{Error, Result};
use std::sync::Arc;

/// Message producer
#[derive(Debug, Clone)]
pub struct Producer {
    id: String,
    ctx: Context,
    router: ExchangeRouter,
    lifecycle: MessageLifecycle,
    queues: QueueManager,
    groups: ConsumerGroups,
    power: Arc<PowerSwitch>,
}

impl Producer {
    /// Create a producer
    pub fn new(ctx: Context) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            router: ExchangeRouter::new(ctx.clone()),
            lifecycle: MessageLifecycle::new(ctx.clone()),
            queues: QueueManager::new(ctx.clone()),
            groups: ConsumerGroups::new(ctx.clone()),
            power: Arc::new(PowerSwitch::new()),
            ctx,
        }
    }

    /// Producer id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the producer accepts messages
    pub fn is_running(&self) -> bool {
        self.power.is_up()
    }

    /// Start the producer
    pub async fn run(&self) -> Result<()> {
        if !self.power.going_up() {
            return Err(Error::InstanceBusy(format!("producer {}", self.id)));
        }
        self.emit(|kind, id| Event::GoingUp { kind, id });

        if let Err(e) = self.ctx.redis.ping().await {
            self.power.rollback();
            return Err(e);
        }

        self.power.commit();
        tracing::info!("Producer {} is up", self.id);
        self.emit(|kind, id| Event::Up { kind, id });
        Ok(())
    }

    /// Stop the producer
    pub async fn shutdown(&self) -> Result<()> {
        if !self.power.going_down() {
            return Err(Error::InstanceBusy(format!("producer {}", self.id)));
        }
        self.emit(|kind, id| Event::GoingDown { kind, id });
        self.power.commit();
        tracing::info!("Producer {} is down", self.id);
        self.emit(|kind, id| Event::Down { kind, id });
        Ok(())
    }

    /// Publish a message
    ///
    /// Returns the id of every stored copy. Nothing is stored unless every
    /// destination queue accepts the message.
    pub async fn produce(&self, message: &ProducibleMessage) -> Result<Vec<String>> {
        if !self.power.is_up() {
            return Err(Error::InstanceNotRunning(format!("producer {}", self.id)));
        }
        message.validate()?;

        let destination = message
            .destination
            .as_ref()
            .ok_or_else(|| Error::Validation("message destination is required".into()))?;
        let queues = self.router.resolve(destination).await?;
        if queues.is_empty() {
            return Err(Error::NoMatchedQueues(describe(destination)));
        }

        let now = now_millis();
        let mut envelopes = Vec::new();
        for queue in queues {
            envelopes.extend(self.envelopes_for(message, queue, now).await?);
        }

        let mut ids = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            self.lifecycle.publish(&envelope).await?;
            ids.push(envelope.id);
        }
        tracing::debug!("Producer {} published {} message(s)", self.id, ids.len());
        Ok(ids)
    }

    async fn envelopes_for(
        &self,
        message: &ProducibleMessage,
        queue: QueueParams,
        now: i64,
    ) -> Result<Vec<MessageEnvelope>> {
        let properties = self.queues.get_properties(&queue).await?;

        match (properties.queue_type, message.priority) {
            (QueueType::Priority, None) => {
                return Err(Error::Validation(format!(
                    "priority queue {} requires a message priority",
                    queue
                )))
            }
            (QueueType::Fifo | QueueType::Lifo, Some(_)) => {
                return Err(Error::Validation(format!(
                    "queue {} does not support message priorities",
                    queue
                )))
            }
            _ => {}
        }

        if !properties.is_pub_sub() {
            if message.consumer_group.is_some() {
                return Err(Error::ConsumerGroupNotSupported(queue.to_string()));
            }
            return Ok(vec![MessageEnvelope::new(message.clone(), queue, None, now)]);
        }

        let groups = match &message.consumer_group {
            Some(group) => vec![group.clone()],
            None => self.groups.list(&queue).await?,
        };
        if groups.is_empty() {
            return Err(Error::ConsumerGroupNotFound(format!(
                "{} has no consumer groups",
                queue
            )));
        }

        Ok(groups
            .into_iter()
            .map(|group| MessageEnvelope::new(message.clone(), queue.clone(), Some(group), now))
            .collect())
    }

    fn emit(&self, event: impl FnOnce(InstanceKind, String) -> Event) {
        self.ctx
            .events
            .emit(event(InstanceKind::Producer, self.id.clone()));
    }
}

fn describe(destination: &MessageDestination) -> String {
    match destination {
        MessageDestination::Queue { queue } => queue.to_string(),
        MessageDestination::Direct {
            exchange,
            routing_key,
        } => format!("direct exchange {} with routing key {}", exchange, routing_key),
        MessageDestination::Topic { exchange, topic } => {
            format!("topic exchange {} with topic {}", exchange, topic)
        }
        MessageDestination::Fanout { exchange } => format!("fanout exchange {}", exchange),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeParams;

    #[test]
    fn test_describe_destination() {
        let exchange = ExchangeParams::new("shop", "events");
        assert_eq!(
            describe(&MessageDestination::Topic {
                exchange: exchange.clone(),
                topic: "order.created".into()
            }),
            "topic exchange events@shop with topic order.created"
        );
        assert_eq!(
            describe(&MessageDestination::Queue {
                queue: QueueParams::new("shop", "orders")
            }),
            "orders@shop"
        );
        assert_eq!(
            describe(&MessageDestination::Fanout { exchange }),
            "fanout exchange events@shop"
        );
    }
}
