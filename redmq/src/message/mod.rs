//! Messages
//!
//! A message is produced from a [`ProducibleMessage`] template. Once
//! published, it is stored as a hash holding the serialized
//! [`MessageEnvelope`] next to its mutable [`MessageState`].

pub mod lifecycle;
pub mod manager;
pub mod producible;
pub mod schedule;

pub use lifecycle::{
    decide_unacknowledgement, DeadLetterReason, DequeueOutcome, MessageLifecycle,
    UnacknowledgementAction, UnacknowledgementReason,
};
pub use manager::MessageManager;
pub use producible::{MessageBuilder, MessageDestination, ProducibleMessage, MAX_PRIORITY};
pub use schedule::{MessageSchedule, ScheduleProgress};

use crate::queue::QueueParams;
use crate::storage::{hash_bytes, hash_i64, hash_str};
use crate::{Error, Result};
use fred::prelude::RedisValue;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Where a message currently is in its lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting in the scheduled set
    Scheduled,
    /// Waiting in a pending container
    #[default]
    Pending,
    /// Held by a consumer
    Processing,
    /// Handled successfully
    Acknowledged,
    /// Handler failed; resolved to pending, scheduled or dead-lettered
    /// within the same atomic step, so only reported through events
    Unacknowledged,
    /// Given up on
    DeadLettered,
}

impl MessageStatus {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Acknowledged => "acknowledged",
            Self::Unacknowledged => "unacknowledged",
            Self::DeadLettered => "dead_lettered",
        }
    }

    /// Whether the message reached a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acknowledged | Self::DeadLettered)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "acknowledged" => Ok(Self::Acknowledged),
            "unacknowledged" => Ok(Self::Unacknowledged),
            "dead_lettered" => Ok(Self::DeadLettered),
            other => Err(Error::Serialization(format!(
                "unknown message status '{}'",
                other
            ))),
        }
    }
}

/// Immutable part of a published message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Message id (UUID v4)
    pub id: String,
    /// Queue the message was published to
    pub queue: QueueParams,
    /// Consumer group, PUB_SUB queues only
    pub consumer_group: Option<String>,
    /// Template the message was produced from
    pub message: ProducibleMessage,
    /// Creation time (ms since epoch)
    pub created_at: i64,
    /// Periodic template this message was copied from
    pub scheduled_message_id: Option<String>,
}

impl MessageEnvelope {
    /// Build an envelope with a fresh id
    pub fn new(
        message: ProducibleMessage,
        queue: QueueParams,
        consumer_group: Option<String>,
        created_at: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue,
            consumer_group,
            message,
            created_at,
            scheduled_message_id: None,
        }
    }

    /// Copy a periodic template into a plain message
    ///
    /// The copy carries no schedule of its own.
    pub fn periodic_copy(&self, now: i64) -> Self {
        let mut message = self.message.clone();
        message.schedule = None;
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue: self.queue.clone(),
            consumer_group: self.consumer_group.clone(),
            message,
            created_at: now,
            scheduled_message_id: Some(self.id.clone()),
        }
    }

    /// Deserialize the body
    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        rmp_serde::from_slice(&self.message.body).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Raw body bytes
    pub fn raw_body(&self) -> &[u8] {
        &self.message.body
    }

    /// Whether the message outlived its TTL, counted from `published_at`
    pub fn is_expired(&self, published_at: i64, now: i64) -> bool {
        match self.message.ttl {
            Some(ttl) if published_at > 0 => published_at + ttl.as_millis() as i64 <= now,
            _ => false,
        }
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Mutable part of a stored message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageState {
    /// Message id
    pub id: String,
    /// Current status
    pub status: MessageStatus,
    /// Failed deliveries so far
    pub attempts: u32,
    /// Copies published from this template
    pub scheduled_times: u32,
    /// Schedule progress of a template
    pub schedule_progress: ScheduleProgress,
    /// Delay applied at the last retry (ms)
    pub next_retry_delay: i64,
    /// Manual requeues
    pub requeue_count: u32,
    /// Reason of the last unacknowledgement
    pub last_unacknowledged_reason: Option<String>,
    /// Processing list holding the message
    pub processing_key: Option<String>,
    /// Periodic template this message was copied from
    pub scheduled_message_id: Option<String>,
    /// Creation (ms)
    pub created_at: i64,
    /// First entry into a pending container (ms, 0 when never published)
    pub published_at: i64,
    /// Due time while scheduled (ms)
    pub scheduled_at: i64,
    /// Last dequeue (ms)
    pub processing_started_at: i64,
    /// Acknowledgement (ms)
    pub acknowledged_at: i64,
    /// Last unacknowledgement (ms)
    pub unacknowledged_at: i64,
    /// Dead-lettering (ms)
    pub dead_lettered_at: i64,
    /// Last manual requeue (ms)
    pub requeued_at: i64,
    /// Last copy published from this template (ms)
    pub last_scheduled_at: i64,
}

impl MessageState {
    pub(crate) fn from_hash(hash: &HashMap<String, RedisValue>) -> Result<Self> {
        let id = hash_str(hash, "id")
            .ok_or_else(|| Error::Serialization("message hash without id".into()))?;
        let status = hash_str(hash, "status")
            .ok_or_else(|| Error::Serialization(format!("message {} without status", id)))?
            .parse()?;

        Ok(Self {
            status,
            attempts: hash_i64(hash, "attempts") as u32,
            scheduled_times: hash_i64(hash, "scheduled_times") as u32,
            schedule_progress: ScheduleProgress {
                repeat_count: hash_i64(hash, "scheduled_repeat_count") as u32,
                cron_fired: hash_i64(hash, "scheduled_cron_fired") == 1,
                pending_delay_ms: hash_i64(hash, "next_scheduled_delay").max(0) as u64,
            },
            next_retry_delay: hash_i64(hash, "next_retry_delay"),
            requeue_count: hash_i64(hash, "requeue_count") as u32,
            last_unacknowledged_reason: hash_str(hash, "last_unacknowledged_reason"),
            processing_key: hash_str(hash, "processing_key"),
            scheduled_message_id: hash_str(hash, "scheduled_message_id"),
            created_at: hash_i64(hash, "created_at"),
            published_at: hash_i64(hash, "published_at"),
            scheduled_at: hash_i64(hash, "scheduled_at"),
            processing_started_at: hash_i64(hash, "processing_started_at"),
            acknowledged_at: hash_i64(hash, "acknowledged_at"),
            unacknowledged_at: hash_i64(hash, "unacknowledged_at"),
            dead_lettered_at: hash_i64(hash, "dead_lettered_at"),
            requeued_at: hash_i64(hash, "requeued_at"),
            last_scheduled_at: hash_i64(hash, "last_scheduled_at"),
            id,
        })
    }
}

/// A message as read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Immutable part
    pub envelope: MessageEnvelope,
    /// Mutable part
    pub state: MessageState,
}

impl StoredMessage {
    pub(crate) fn from_hash(hash: &HashMap<String, RedisValue>) -> Result<Self> {
        let envelope = MessageEnvelope::decode(hash_bytes(hash, "message")?)?;
        let state = MessageState::from_hash(hash)?;
        Ok(Self { envelope, state })
    }

    /// Message id
    pub fn id(&self) -> &str {
        &self.envelope.id
    }

    /// Deserialize the body
    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        self.envelope.body()
    }

    /// Whether the message outlived its TTL
    pub fn is_expired(&self, now: i64) -> bool {
        self.envelope.is_expired(self.state.published_at, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn envelope() -> MessageEnvelope {
        let message = ProducibleMessage::builder()
            .queue(QueueParams::new("shop", "orders"))
            .body(&"hello")
            .unwrap()
            .ttl(Duration::from_secs(10))
            .build()
            .unwrap();
        MessageEnvelope::new(message, QueueParams::new("shop", "orders"), None, 1_000)
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            MessageStatus::Scheduled,
            MessageStatus::Pending,
            MessageStatus::Processing,
            MessageStatus::Acknowledged,
            MessageStatus::Unacknowledged,
            MessageStatus::DeadLettered,
        ] {
            assert_eq!(status.as_str().parse::<MessageStatus>().unwrap(), status);
        }
        assert!(MessageStatus::DeadLettered.is_terminal());
        assert!(!MessageStatus::Processing.is_terminal());
        assert!(!MessageStatus::Unacknowledged.is_terminal());
        assert!("gone".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn test_envelope_encoding() {
        let env = envelope();
        let decoded = MessageEnvelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.body::<String>().unwrap(), "hello");
    }

    #[test]
    fn test_expiry() {
        let env = envelope();
        assert!(!env.is_expired(0, 1_000_000));
        assert!(!env.is_expired(1_000, 10_999));
        assert!(env.is_expired(1_000, 11_000));
    }

    #[test]
    fn test_periodic_copy_drops_schedule() {
        let mut template = envelope();
        template.message.schedule = Some(MessageSchedule {
            repeat: 2,
            repeat_period: Some(Duration::from_secs(1)),
            ..Default::default()
        });

        let copy = template.periodic_copy(5_000);
        assert_ne!(copy.id, template.id);
        assert!(copy.message.schedule.is_none());
        assert_eq!(copy.scheduled_message_id.as_deref(), Some(template.id.as_str()));
        assert_eq!(copy.created_at, 5_000);
    }

    #[test]
    fn test_state_from_hash() {
        let mut hash: HashMap<String, RedisValue> = HashMap::new();
        hash.insert("id".into(), "m1".into());
        hash.insert("status".into(), "dead_lettered".into());
        hash.insert("attempts".into(), "3".into());
        hash.insert("published_at".into(), "100".into());
        hash.insert("last_unacknowledged_reason".into(), "handler_error".into());
        hash.insert("processing_key".into(), "".into());

        let state = MessageState::from_hash(&hash).unwrap();
        assert_eq!(state.status, MessageStatus::DeadLettered);
        assert_eq!(state.attempts, 3);
        assert_eq!(state.published_at, 100);
        assert_eq!(state.last_unacknowledged_reason.as_deref(), Some("handler_error"));
        assert!(state.processing_key.is_none());
    }
}
