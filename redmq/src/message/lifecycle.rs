//! Message lifecycle engine
//!
//! Moves a message between the scheduled set, a pending container, a
//! consumer's processing list and the acknowledged or dead-lettered
//! archives. Each move is one Lua script, so a message occupies exactly one
//! location at any instant.

use super::{MessageEnvelope, MessageState, MessageStatus, ScheduleProgress, StoredMessage};
use crate::context::Context;
use crate::events::Event;
use crate::queue::{QueueOperation, QueueParams};
use crate::storage::{now_millis, Keys, LuaScript, QueueKeys};
use crate::{Error, Result};
use chrono::{TimeZone, Utc};
use fred::prelude::RedisValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Why a message was not acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnacknowledgementReason {
    /// The handler exceeded the consume timeout
    Timeout,
    /// The handler returned an error
    HandlerError,
    /// The consumer holding the message stopped sending heartbeats
    OfflineConsumer,
    /// The message outlived its TTL before being handled
    TtlExpired,
}

impl UnacknowledgementReason {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::HandlerError => "handler_error",
            Self::OfflineConsumer => "offline_consumer",
            Self::TtlExpired => "ttl_expired",
        }
    }
}

impl fmt::Display for UnacknowledgementReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a message was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// TTL expired
    TtlExpired,
    /// Retry threshold reached
    RetryThresholdExceeded,
    /// Copies of periodic messages are never retried
    PeriodicMessage,
}

impl DeadLetterReason {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TtlExpired => "ttl_expired",
            Self::RetryThresholdExceeded => "retry_threshold_exceeded",
            Self::PeriodicMessage => "periodic_message",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an unacknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnacknowledgementAction {
    /// Back to the pending container
    Requeue,
    /// Into the scheduled set, due after the delay
    Delay(Duration),
    /// Into the dead-letter archive (or deleted when not archived)
    DeadLetter(DeadLetterReason),
}

impl UnacknowledgementAction {
    fn script_arg(&self) -> &'static str {
        match self {
            Self::Requeue => "requeue",
            Self::Delay(_) => "delay",
            Self::DeadLetter(_) => "dead_letter",
        }
    }
}

/// Decide what happens to a message that was not acknowledged
///
/// `state.attempts` counts failures before this one.
pub fn decide_unacknowledgement(
    envelope: &MessageEnvelope,
    state: &MessageState,
    reason: UnacknowledgementReason,
    now: i64,
) -> UnacknowledgementAction {
    if reason == UnacknowledgementReason::TtlExpired
        || envelope.is_expired(state.published_at, now)
    {
        return UnacknowledgementAction::DeadLetter(DeadLetterReason::TtlExpired);
    }
    if state.attempts >= envelope.message.retry_threshold {
        return UnacknowledgementAction::DeadLetter(DeadLetterReason::RetryThresholdExceeded);
    }
    if envelope.scheduled_message_id.is_some() {
        return UnacknowledgementAction::DeadLetter(DeadLetterReason::PeriodicMessage);
    }
    if !envelope.message.retry_delay.is_zero() {
        return UnacknowledgementAction::Delay(envelope.message.retry_delay);
    }
    UnacknowledgementAction::Requeue
}

/// Result of a dequeue attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DequeueOutcome {
    /// A message moved to the consumer's processing list
    Message(Box<StoredMessage>),
    /// Nothing pending
    Empty,
    /// The queue's rate limit window is exhausted
    RateLimited(Duration),
}

/// Atomic message moves
#[derive(Debug, Clone)]
pub struct MessageLifecycle {
    ctx: Context,
}

impl MessageLifecycle {
    /// Create a lifecycle engine
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Store a new message, scheduled or pending
    pub async fn publish(&self, envelope: &MessageEnvelope) -> Result<MessageStatus> {
        let now = now_millis();
        let mut progress = ScheduleProgress::default();
        let mut scheduled_at = 0;

        if let Some(schedule) = envelope.message.schedule.as_ref().filter(|s| s.is_schedulable()) {
            progress = ScheduleProgress::initial(schedule);
            if let Some(ts) = schedule.next_timestamp(&mut progress, utc(now))? {
                scheduled_at = ts;
            }
        }

        let queue = &envelope.queue;
        let keys = QueueKeys::new(queue);
        let group = envelope.consumer_group.as_deref();
        let reply = self
            .ctx
            .redis
            .eval_script(
                LuaScript::PublishMessage,
                vec![
                    keys.properties.clone(),
                    keys.messages.clone(),
                    keys.pending(group),
                    keys.scheduled.clone(),
                    keys.priority_sequence.clone(),
                    Keys::message(&envelope.id),
                    keys.consumer_groups.clone(),
                ],
                vec![
                    QueueOperation::Produce.mask_arg().into(),
                    envelope.id.as_str().into(),
                    envelope_arg(envelope)?,
                    queue.id().into(),
                    group.unwrap_or_default().into(),
                    envelope
                        .message
                        .priority
                        .map(|p| p.to_string())
                        .unwrap_or_default()
                        .into(),
                    scheduled_at.to_string().into(),
                    now.to_string().into(),
                    progress.repeat_count.to_string().into(),
                    if progress.cron_fired { "1" } else { "0" }.into(),
                    progress.pending_delay_ms.to_string().into(),
                    envelope.created_at.to_string().into(),
                ],
            )
            .await?
            .check(&queue.to_string(), Some(QueueOperation::Produce))?;

        let status: MessageStatus = reply.value(1).unwrap_or("pending").parse()?;
        tracing::debug!("Message {} published to {} as {}", envelope.id, queue, status);
        self.ctx.events.emit(Event::MessagePublished {
            id: envelope.id.clone(),
            queue: queue.clone(),
            consumer_group: envelope.consumer_group.clone(),
            scheduled: status == MessageStatus::Scheduled,
        });
        Ok(status)
    }

    /// Move the next pending message into the consumer's processing list
    pub async fn dequeue(
        &self,
        queue: &QueueParams,
        consumer_group: Option<&str>,
        consumer_id: &str,
    ) -> Result<DequeueOutcome> {
        let keys = QueueKeys::new(queue);
        let reply = self
            .ctx
            .redis
            .eval_script(
                LuaScript::DequeueMessage,
                vec![
                    keys.properties.clone(),
                    keys.pending(consumer_group),
                    keys.processing(consumer_id, consumer_group),
                    keys.rate_limit_counter.clone(),
                    keys.processing_queues.clone(),
                    Keys::consumer_processing(consumer_id),
                ],
                vec![
                    QueueOperation::Consume.mask_arg().into(),
                    Keys::message_prefix().into(),
                    now_millis().to_string().into(),
                    queue.id().into(),
                ],
            )
            .await?;

        match reply.code() {
            "EMPTY" => Ok(DequeueOutcome::Empty),
            "RATE_LIMITED" => Ok(DequeueOutcome::RateLimited(Duration::from_millis(
                reply.int(0).max(1) as u64,
            ))),
            _ => {
                let reply = reply.check(&queue.to_string(), Some(QueueOperation::Consume))?;
                let id = reply
                    .value(0)
                    .ok_or_else(|| Error::Script("dequeue returned no message id".into()))?;
                let message = self.load(id).await?;
                tracing::trace!("Message {} dequeued from {} by {}", id, queue, consumer_id);
                Ok(DequeueOutcome::Message(Box::new(message)))
            }
        }
    }

    /// Read a stored message
    pub async fn load(&self, id: &str) -> Result<StoredMessage> {
        let hash = self.ctx.redis.hgetall(&Keys::message(id)).await?;
        if hash.is_empty() {
            return Err(Error::MessageNotFound(id.to_string()));
        }
        StoredMessage::from_hash(&hash)
    }

    /// Acknowledge a message held in `processing_key`
    pub async fn acknowledge(
        &self,
        envelope: &MessageEnvelope,
        processing_key: &str,
        consumer_id: &str,
    ) -> Result<()> {
        let keys = QueueKeys::new(&envelope.queue);
        let storage = &self.ctx.config.message_storage.acknowledged;
        self.ctx
            .redis
            .eval_script(
                LuaScript::AcknowledgeMessage,
                vec![
                    processing_key.to_string(),
                    Keys::message(&envelope.id),
                    keys.acknowledged,
                    keys.messages,
                ],
                vec![
                    envelope.id.as_str().into(),
                    now_millis().to_string().into(),
                    if storage.store { "1" } else { "0" }.into(),
                    storage.queue_size.to_string().into(),
                    storage.expire_secs().to_string().into(),
                    Keys::message_prefix().into(),
                ],
            )
            .await?
            .check(&envelope.id, None)?;

        tracing::debug!("Message {} acknowledged on {}", envelope.id, envelope.queue);
        self.ctx.events.emit(Event::MessageAcknowledged {
            id: envelope.id.clone(),
            queue: envelope.queue.clone(),
            consumer_group: envelope.consumer_group.clone(),
            consumer_id: consumer_id.to_string(),
        });
        Ok(())
    }

    /// Run a message held in `processing_key` through the unacknowledgement
    /// branch
    pub async fn unacknowledge(
        &self,
        message: &StoredMessage,
        processing_key: &str,
        consumer_id: &str,
        reason: UnacknowledgementReason,
    ) -> Result<UnacknowledgementAction> {
        let envelope = &message.envelope;
        let now = now_millis();
        let action = decide_unacknowledgement(envelope, &message.state, reason, now);

        let keys = QueueKeys::new(&envelope.queue);
        let group = envelope.consumer_group.as_deref();
        let storage = &self.ctx.config.message_storage.dead_lettered;
        let delay_ms = match action {
            UnacknowledgementAction::Delay(delay) => delay.as_millis() as u64,
            _ => 0,
        };

        self.ctx
            .redis
            .eval_script(
                LuaScript::UnacknowledgeMessage,
                vec![
                    keys.properties.clone(),
                    processing_key.to_string(),
                    Keys::message(&envelope.id),
                    keys.pending(group),
                    keys.scheduled.clone(),
                    keys.dead_lettered.clone(),
                    keys.messages.clone(),
                    keys.priority_sequence.clone(),
                ],
                vec![
                    envelope.id.as_str().into(),
                    action.script_arg().into(),
                    reason.as_str().into(),
                    now.to_string().into(),
                    delay_ms.to_string().into(),
                    if storage.store { "1" } else { "0" }.into(),
                    storage.queue_size.to_string().into(),
                    storage.expire_secs().to_string().into(),
                    Keys::message_prefix().into(),
                ],
            )
            .await?
            .check(&envelope.id, None)?;

        let id = envelope.id.clone();
        let queue = envelope.queue.clone();
        let consumer_group = envelope.consumer_group.clone();
        tracing::debug!("Message {} unacknowledged ({}): {:?}", id, reason, action);
        self.ctx.events.emit(Event::MessageUnacknowledged {
            id: id.clone(),
            queue: queue.clone(),
            consumer_group: consumer_group.clone(),
            consumer_id: consumer_id.to_string(),
            reason,
        });

        let follow_up = match action {
            UnacknowledgementAction::Requeue => Event::MessageRequeued {
                id,
                queue,
                consumer_group,
            },
            UnacknowledgementAction::Delay(delay) => Event::MessageDelayed {
                id,
                queue,
                consumer_group,
                delay_ms: delay.as_millis() as u64,
            },
            UnacknowledgementAction::DeadLetter(reason) => {
                tracing::warn!("Message {} dead-lettered on {}: {}", id, queue, reason);
                Event::MessageDeadLettered {
                    id,
                    queue,
                    consumer_group,
                    reason,
                }
            }
        };
        self.ctx.events.emit(follow_up);
        Ok(action)
    }

    /// Unacknowledge every message left in `processing_key`, returning how
    /// many were released
    pub async fn release_processing(
        &self,
        processing_key: &str,
        consumer_id: &str,
        reason: UnacknowledgementReason,
    ) -> Result<u64> {
        let redis = &self.ctx.redis;
        let mut released = 0;
        for id in redis.lrange(processing_key, 0, -1).await? {
            let message = match self.load(&id).await {
                Ok(message) => message,
                Err(Error::MessageNotFound(_)) => {
                    redis.lrem(processing_key, &id, 0).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            match self.unacknowledge(&message, processing_key, consumer_id, reason).await {
                Ok(_) => released += 1,
                // handled concurrently
                Err(Error::MessageNotInProcessing(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(released)
    }

    /// Publish a due entry of the scheduled set
    ///
    /// Delayed messages move to pending in place. Periodic templates publish
    /// a copy and are rescheduled, or retired when their schedule is over.
    /// Returns the id of the message that became pending, `None` when the
    /// entry was not due or disappeared.
    pub async fn publish_scheduled(&self, queue: &QueueParams, id: &str) -> Result<Option<String>> {
        let keys = QueueKeys::new(queue);
        let message = match self.load(id).await {
            Ok(message) => message,
            Err(Error::MessageNotFound(_)) => {
                // hash expired or deleted under us
                self.ctx.redis.zrem(&keys.scheduled, id).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let now = now_millis();
        let envelope = &message.envelope;
        let template = envelope.scheduled_message_id.is_none()
            && envelope.message.schedule.as_ref().is_some_and(|s| s.is_periodic());

        let mut progress = message.state.schedule_progress;
        let (copy, next_at) = match (&envelope.message.schedule, template) {
            (Some(schedule), true) => {
                let next = schedule.next_timestamp(&mut progress, utc(now))?;
                (Some(envelope.periodic_copy(now)), next.unwrap_or(0))
            }
            _ => (None, 0),
        };

        let copy_key = copy
            .as_ref()
            .map(|c| Keys::message(&c.id))
            .unwrap_or_else(|| Keys::message(id));
        let copy_envelope = match &copy {
            Some(c) => envelope_arg(c)?,
            None => RedisValue::Bytes(Default::default()),
        };

        let reply = self
            .ctx
            .redis
            .eval_script(
                LuaScript::PublishScheduledMessage,
                vec![
                    keys.properties.clone(),
                    keys.scheduled.clone(),
                    keys.pending(envelope.consumer_group.as_deref()),
                    keys.messages.clone(),
                    keys.priority_sequence.clone(),
                    Keys::message(id),
                    copy_key,
                    keys.consumer_groups.clone(),
                ],
                vec![
                    QueueOperation::Produce.mask_arg().into(),
                    id.into(),
                    now.to_string().into(),
                    copy.as_ref().map(|c| c.id.clone()).unwrap_or_default().into(),
                    copy_envelope,
                    next_at.to_string().into(),
                    progress.repeat_count.to_string().into(),
                    if progress.cron_fired { "1" } else { "0" }.into(),
                    progress.pending_delay_ms.to_string().into(),
                ],
            )
            .await?;

        match reply.code() {
            "MESSAGE_NOT_DUE" | "MESSAGE_NOT_FOUND" => return Ok(None),
            "CONSUMER_GROUP_NOT_FOUND" => {
                tracing::warn!(
                    "Schedule of message {} retired: consumer group {} of {} is gone",
                    id,
                    reply.value(0).unwrap_or_default(),
                    queue
                );
                return Ok(None);
            }
            _ => {}
        }
        let reply = reply.check(&queue.to_string(), Some(QueueOperation::Produce))?;
        let published = reply.value(0).unwrap_or(id).to_string();

        if template && next_at == 0 {
            tracing::debug!("Schedule of message {} on {} finished", id, queue);
        }
        self.ctx.events.emit(Event::MessagePublished {
            id: published.clone(),
            queue: queue.clone(),
            consumer_group: envelope.consumer_group.clone(),
            scheduled: false,
        });
        Ok(Some(published))
    }
}

/// Encoded envelope as a binary script argument
fn envelope_arg(envelope: &MessageEnvelope) -> Result<RedisValue> {
    Ok(RedisValue::Bytes(envelope.encode()?.into()))
}

fn utc(millis: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}
