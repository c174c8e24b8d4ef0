//! Producible messages
//!
//! Provides the immutable message template handed to a producer and its
//! fluent builder.

use super::schedule::MessageSchedule;
use crate::exchange::ExchangeParams;
use crate::queue::QueueParams;
use crate::storage::keys::validate_name;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Highest message priority
pub const MAX_PRIORITY: u8 = 7;

/// Default number of requeues before a failing message is dead-lettered
pub const DEFAULT_RETRY_THRESHOLD: u32 = 3;

/// Default delay before a failed message is retried
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Where a message is published to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDestination {
    /// A single queue
    Queue {
        /// Target queue
        queue: QueueParams,
    },
    /// Queues bound to a direct exchange under `routing_key`
    Direct {
        /// Exchange
        exchange: ExchangeParams,
        /// Routing key
        routing_key: String,
    },
    /// Queues bound to a topic exchange with a pattern matching `topic`
    Topic {
        /// Exchange
        exchange: ExchangeParams,
        /// Dot-separated topic
        topic: String,
    },
    /// Every queue bound to a fanout exchange
    Fanout {
        /// Exchange
        exchange: ExchangeParams,
    },
}

/// Immutable message template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducibleMessage {
    /// Message body
    pub body: Vec<u8>,
    /// Priority (`0..=7`, higher is delivered first), priority queues only
    pub priority: Option<u8>,
    /// Time to live, counted from publication
    pub ttl: Option<Duration>,
    /// Failed deliveries tolerated before dead-lettering
    pub retry_threshold: u32,
    /// Delay before a failed message is retried (zero requeues at once)
    pub retry_delay: Duration,
    /// Upper bound for one handler invocation
    pub consume_timeout: Option<Duration>,
    /// Scheduling parameters
    pub schedule: Option<MessageSchedule>,
    /// Destination
    pub destination: Option<MessageDestination>,
    /// Consumer group, PUB_SUB queues only
    pub consumer_group: Option<String>,
}

impl Default for ProducibleMessage {
    fn default() -> Self {
        Self {
            body: Vec::new(),
            priority: None,
            ttl: None,
            retry_threshold: DEFAULT_RETRY_THRESHOLD,
            retry_delay: DEFAULT_RETRY_DELAY,
            consume_timeout: None,
            schedule: None,
            destination: None,
            consumer_group: None,
        }
    }
}

impl ProducibleMessage {
    /// Start building a message
    #[must_use]
    pub fn builder() -> MessageBuilder {
        MessageBuilder::new()
    }

    /// Validate the message before any store access
    pub fn validate(&self) -> Result<()> {
        if let Some(priority) = self.priority {
            if priority > MAX_PRIORITY {
                return Err(Error::Validation(format!(
                    "priority must be between 0 and {} (got {})",
                    MAX_PRIORITY, priority
                )));
            }
        }

        if let Some(ttl) = self.ttl {
            if ttl.is_zero() {
                return Err(Error::Validation("ttl must be greater than 0".into()));
            }
        }

        if let Some(timeout) = self.consume_timeout {
            if timeout.is_zero() {
                return Err(Error::Validation(
                    "consume timeout must be greater than 0".into(),
                ));
            }
        }

        if let Some(schedule) = &self.schedule {
            schedule.validate()?;
        }

        if let Some(group) = &self.consumer_group {
            validate_name(group)
                .map_err(|e| Error::Validation(format!("consumer group: {}", e)))?;
        }

        match &self.destination {
            None => Err(Error::Validation("message destination is required".into())),
            Some(MessageDestination::Direct { routing_key, .. }) => {
                validate_name(routing_key)
                    .map_err(|e| Error::Validation(format!("routing key: {}", e)))?;
                Ok(())
            }
            Some(MessageDestination::Topic { topic, .. }) => {
                crate::exchange::TopicPattern::validate_topic(topic)
            }
            Some(_) => Ok(()),
        }
    }

    /// Whether the message must go through the scheduled set
    pub fn is_schedulable(&self) -> bool {
        self.schedule
            .as_ref()
            .map(MessageSchedule::is_schedulable)
            .unwrap_or(false)
    }

    /// Whether the message is a periodic template
    pub fn is_periodic(&self) -> bool {
        self.schedule
            .as_ref()
            .map(MessageSchedule::is_periodic)
            .unwrap_or(false)
    }
}

/// Message builder
///
/// # Examples
///
/// ```rust
/// use redmq::message::ProducibleMessage;
/// use redmq::queue::QueueParams;
/// use std::time::Duration;
///
/// # fn example() -> redmq::Result<()> {
/// let message = ProducibleMessage::builder()
///     .queue(QueueParams::new("shop", "orders"))
///     .body(&("order", 42))?
///     .retry_threshold(5)
///     .retry_delay(Duration::ZERO)
///     .ttl(Duration::from_secs(3600))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MessageBuilder {
    message: ProducibleMessage,
}

impl MessageBuilder {
    /// Create a new message builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the body, serialized with MessagePack
    pub fn body<T: Serialize>(mut self, body: &T) -> Result<Self> {
        self.message.body =
            rmp_serde::to_vec(body).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(self)
    }

    /// Set a raw binary body
    #[must_use]
    pub fn raw_body(mut self, body: Vec<u8>) -> Self {
        self.message.body = body;
        self
    }

    /// Set priority (`0..=7`, higher is delivered first)
    #[must_use]
    pub fn priority(mut self, priority: u8) -> Self {
        self.message.priority = Some(priority);
        self
    }

    /// Set time to live
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.message.ttl = Some(ttl);
        self
    }

    /// Set retry threshold
    #[must_use]
    pub fn retry_threshold(mut self, threshold: u32) -> Self {
        self.message.retry_threshold = threshold;
        self
    }

    /// Set retry delay
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.message.retry_delay = delay;
        self
    }

    /// Set consume timeout
    #[must_use]
    pub fn consume_timeout(mut self, timeout: Duration) -> Self {
        self.message.consume_timeout = Some(timeout);
        self
    }

    /// Delay the first publication
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.schedule_mut().delay = Some(delay);
        self
    }

    /// Publish copies on a cron schedule
    #[must_use]
    pub fn cron(mut self, expr: impl Into<String>) -> Self {
        self.schedule_mut().cron = Some(expr.into());
        self
    }

    /// Publish `count` copies spaced by `period`
    #[must_use]
    pub fn repeat(mut self, count: u32, period: Duration) -> Self {
        let schedule = self.schedule_mut();
        schedule.repeat = count;
        schedule.repeat_period = Some(period);
        self
    }

    /// Publish to a queue
    #[must_use]
    pub fn queue(mut self, queue: QueueParams) -> Self {
        self.message.destination = Some(MessageDestination::Queue { queue });
        self
    }

    /// Publish through a direct exchange
    #[must_use]
    pub fn direct(mut self, exchange: ExchangeParams, routing_key: impl Into<String>) -> Self {
        self.message.destination = Some(MessageDestination::Direct {
            exchange,
            routing_key: routing_key.into(),
        });
        self
    }

    /// Publish through a topic exchange
    #[must_use]
    pub fn topic(mut self, exchange: ExchangeParams, topic: impl Into<String>) -> Self {
        self.message.destination = Some(MessageDestination::Topic {
            exchange,
            topic: topic.into(),
        });
        self
    }

    /// Publish through a fanout exchange
    #[must_use]
    pub fn fanout(mut self, exchange: ExchangeParams) -> Self {
        self.message.destination = Some(MessageDestination::Fanout { exchange });
        self
    }

    /// Restrict delivery to one consumer group of a PUB_SUB queue
    #[must_use]
    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.message.consumer_group = Some(group.into());
        self
    }

    fn schedule_mut(&mut self) -> &mut MessageSchedule {
        self.message.schedule.get_or_insert_with(MessageSchedule::default)
    }

    /// Build the message
    pub fn build(self) -> Result<ProducibleMessage> {
        let mut message = self.message;
        if let Some(group) = message.consumer_group.take() {
            message.consumer_group = Some(group.to_lowercase());
        }
        message.validate()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Order {
        id: u32,
    }

    fn queue() -> QueueParams {
        QueueParams::new("shop", "orders")
    }

    #[test]
    fn test_builder_defaults() {
        let message = MessageBuilder::new()
            .queue(queue())
            .body(&Order { id: 1 })
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(message.retry_threshold, 3);
        assert_eq!(message.retry_delay, Duration::from_secs(60));
        assert!(message.priority.is_none());
        assert!(!message.is_schedulable());
        let decoded: Order = rmp_serde::from_slice(&message.body).unwrap();
        assert_eq!(decoded, Order { id: 1 });
    }

    #[test]
    fn test_builder_requires_destination() {
        let result = MessageBuilder::new().raw_body(b"x".to_vec()).build();
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_priority_range() {
        assert!(MessageBuilder::new().queue(queue()).priority(7).build().is_ok());
        assert!(MessageBuilder::new().queue(queue()).priority(8).build().is_err());
    }

    #[test]
    fn test_schedule_options() {
        let message = MessageBuilder::new()
            .queue(queue())
            .delay(Duration::from_secs(5))
            .repeat(2, Duration::from_secs(1))
            .build()
            .unwrap();
        assert!(message.is_schedulable());
        assert!(message.is_periodic());

        let bad = MessageBuilder::new()
            .queue(queue())
            .repeat(2, Duration::ZERO)
            .build();
        assert!(bad.is_err());

        let bad_cron = MessageBuilder::new().queue(queue()).cron("every day").build();
        assert!(bad_cron.is_err());
    }

    #[test]
    fn test_exchange_destinations_validate() {
        let exchange = ExchangeParams::new("shop", "events");
        assert!(MessageBuilder::new()
            .topic(exchange.clone(), "order.created")
            .build()
            .is_ok());
        assert!(MessageBuilder::new()
            .topic(exchange.clone(), "order..created")
            .build()
            .is_err());
        assert!(MessageBuilder::new()
            .direct(exchange.clone(), "")
            .build()
            .is_err());
        assert!(MessageBuilder::new().fanout(exchange).build().is_ok());
    }

    #[test]
    fn test_consumer_group_normalized() {
        let message = MessageBuilder::new()
            .queue(queue())
            .consumer_group("Billing")
            .build()
            .unwrap();
        assert_eq!(message.consumer_group.as_deref(), Some("billing"));
    }
}
