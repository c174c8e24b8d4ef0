//! Broker events
//!
//! Components publish [`Event`]s on the [`EventBus`] carried by the
//! [`crate::Context`]. Emission never waits for subscribers and never fails;
//! with no subscriber, or with the bus disabled, events are dropped.

use crate::message::{DeadLetterReason, UnacknowledgementReason};
use crate::queue::{QueueDeliveryModel, QueueOperationalState, QueueParams, QueueType};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event bus configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Emit events at all
    pub enabled: bool,
    /// Events buffered per subscriber before the slowest one lags
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 1024,
        }
    }
}

/// Kind of instance reporting a power state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    /// A [`crate::Producer`]
    Producer,
    /// A [`crate::Consumer`]
    Consumer,
}

/// Something that happened in the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Queue created
    QueueCreated {
        /// Queue
        queue: QueueParams,
        /// Ordering
        queue_type: QueueType,
        /// Delivery model
        delivery_model: QueueDeliveryModel,
    },
    /// Queue deleted
    QueueDeleted {
        /// Queue
        queue: QueueParams,
    },
    /// Queue operational state changed
    QueueStateChanged {
        /// Queue
        queue: QueueParams,
        /// Previous state
        from: QueueOperationalState,
        /// New state
        to: QueueOperationalState,
        /// Reason given by the caller
        reason: Option<String>,
    },
    /// Consumer group added to a PUB_SUB queue
    ConsumerGroupCreated {
        /// Queue
        queue: QueueParams,
        /// Group
        group: String,
    },
    /// Consumer group removed
    ConsumerGroupDeleted {
        /// Queue
        queue: QueueParams,
        /// Group
        group: String,
    },
    /// Message stored as pending or scheduled
    MessagePublished {
        /// Message id
        id: String,
        /// Queue
        queue: QueueParams,
        /// Consumer group
        consumer_group: Option<String>,
        /// Whether the message went to the scheduled set
        scheduled: bool,
    },
    /// Message handled successfully
    MessageAcknowledged {
        /// Message id
        id: String,
        /// Queue
        queue: QueueParams,
        /// Consumer group
        consumer_group: Option<String>,
        /// Consumer that handled it
        consumer_id: String,
    },
    /// Message not handled
    MessageUnacknowledged {
        /// Message id
        id: String,
        /// Queue
        queue: QueueParams,
        /// Consumer group
        consumer_group: Option<String>,
        /// Consumer that held it
        consumer_id: String,
        /// Why
        reason: UnacknowledgementReason,
    },
    /// Message back to pending
    MessageRequeued {
        /// Message id
        id: String,
        /// Queue
        queue: QueueParams,
        /// Consumer group
        consumer_group: Option<String>,
    },
    /// Message delayed before its next attempt
    MessageDelayed {
        /// Message id
        id: String,
        /// Queue
        queue: QueueParams,
        /// Consumer group
        consumer_group: Option<String>,
        /// Delay in milliseconds
        delay_ms: u64,
    },
    /// Message dead-lettered
    MessageDeadLettered {
        /// Message id
        id: String,
        /// Queue
        queue: QueueParams,
        /// Consumer group
        consumer_group: Option<String>,
        /// Why
        reason: DeadLetterReason,
    },
    /// Instance starting
    GoingUp {
        /// Producer or consumer
        kind: InstanceKind,
        /// Instance id
        id: String,
    },
    /// Instance running
    Up {
        /// Producer or consumer
        kind: InstanceKind,
        /// Instance id
        id: String,
    },
    /// Instance stopping
    GoingDown {
        /// Producer or consumer
        kind: InstanceKind,
        /// Instance id
        id: String,
    },
    /// Instance stopped
    Down {
        /// Producer or consumer
        kind: InstanceKind,
        /// Instance id
        id: String,
    },
    /// Instance failure that stopped it or needs attention
    Error {
        /// Producer or consumer
        kind: InstanceKind,
        /// Instance id
        id: String,
        /// Description
        message: String,
    },
}

impl Event {
    /// Short name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Self::QueueCreated { .. } => "queue_created",
            Self::QueueDeleted { .. } => "queue_deleted",
            Self::QueueStateChanged { .. } => "queue_state_changed",
            Self::ConsumerGroupCreated { .. } => "consumer_group_created",
            Self::ConsumerGroupDeleted { .. } => "consumer_group_deleted",
            Self::MessagePublished { .. } => "message_published",
            Self::MessageAcknowledged { .. } => "message_acknowledged",
            Self::MessageUnacknowledged { .. } => "message_unacknowledged",
            Self::MessageRequeued { .. } => "message_requeued",
            Self::MessageDelayed { .. } => "message_delayed",
            Self::MessageDeadLettered { .. } => "message_dead_lettered",
            Self::GoingUp { .. } => "going_up",
            Self::Up { .. } => "up",
            Self::GoingDown { .. } => "going_down",
            Self::Down { .. } => "down",
            Self::Error { .. } => "error",
        }
    }
}

/// Broadcast channel of broker events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: Option<broadcast::Sender<Event>>,
}

impl EventBus {
    /// Create an event bus
    pub fn new(config: &EventBusConfig) -> Self {
        let sender = config
            .enabled
            .then(|| broadcast::channel(config.capacity.max(1)).0);
        Self { sender }
    }

    /// An event bus that drops everything
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Whether events are emitted
    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Emit an event
    pub fn emit(&self, event: Event) {
        if let Some(sender) = &self.sender {
            tracing::trace!("Event {}", event.name());
            // no receiver is not an error
            let _ = sender.send(event);
        }
    }

    /// Subscribe to events emitted from now on
    ///
    /// Returns `None` when the bus is disabled.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<Event>> {
        self.sender.as_ref().map(broadcast::Sender::subscribe)
    }
}
