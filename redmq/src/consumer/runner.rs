//! Per-queue consumption loop

use super::MessageHandler;
use crate::context::Context;
use crate::message::{
    DequeueOutcome, MessageLifecycle, StoredMessage, UnacknowledgementAction,
    UnacknowledgementReason,
};
use crate::queue::QueueParams;
use crate::storage::{now_millis, QueueKeys};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Wait after a failed step before polling again
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What one [`MessageHandlerRunner::step`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Handler succeeded and the message was acknowledged
    Acknowledged(String),
    /// Message went through the unacknowledgement branch
    Unacknowledged {
        /// Message id
        id: String,
        /// Why
        reason: UnacknowledgementReason,
        /// What happened to it
        action: UnacknowledgementAction,
    },
    /// Nothing pending
    Empty,
    /// Rate limit window exhausted for the given time
    RateLimited(Duration),
}

/// Drives one handler against one queue (and consumer group)
pub struct MessageHandlerRunner {
    consumer_id: String,
    queue: QueueParams,
    consumer_group: Option<String>,
    processing_key: String,
    handler: Arc<dyn MessageHandler>,
    lifecycle: MessageLifecycle,
}

impl std::fmt::Debug for MessageHandlerRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHandlerRunner")
            .field("consumer_id", &self.consumer_id)
            .field("queue", &self.queue)
            .field("consumer_group", &self.consumer_group)
            .finish()
    }
}

impl MessageHandlerRunner {
    /// Create a runner
    pub fn new(
        ctx: Context,
        consumer_id: impl Into<String>,
        queue: QueueParams,
        consumer_group: Option<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let consumer_id = consumer_id.into();
        let processing_key =
            QueueKeys::new(&queue).processing(&consumer_id, consumer_group.as_deref());
        Self {
            consumer_id,
            queue,
            consumer_group,
            processing_key,
            handler,
            lifecycle: MessageLifecycle::new(ctx),
        }
    }

    /// Queue consumed
    pub fn queue(&self) -> &QueueParams {
        &self.queue
    }

    /// Consumer group consumed, if any
    pub fn consumer_group(&self) -> Option<&str> {
        self.consumer_group.as_deref()
    }

    /// Processing list of this runner
    pub fn processing_key(&self) -> &str {
        &self.processing_key
    }

    /// Hand back every message still in the processing list
    pub async fn release(&self) -> Result<u64> {
        self.lifecycle
            .release_processing(
                &self.processing_key,
                &self.consumer_id,
                UnacknowledgementReason::OfflineConsumer,
            )
            .await
    }

    /// Dequeue and handle at most one message
    pub async fn step(&self) -> Result<StepOutcome> {
        let outcome = self
            .lifecycle
            .dequeue(&self.queue, self.consumer_group.as_deref(), &self.consumer_id)
            .await?;
        let message = match outcome {
            DequeueOutcome::Message(message) => *message,
            DequeueOutcome::Empty => return Ok(StepOutcome::Empty),
            DequeueOutcome::RateLimited(wait) => return Ok(StepOutcome::RateLimited(wait)),
        };

        if message.is_expired(now_millis()) {
            return self
                .unacknowledge(&message, UnacknowledgementReason::TtlExpired)
                .await;
        }

        match self.invoke(&message).await {
            None => {
                self.lifecycle
                    .acknowledge(&message.envelope, &self.processing_key, &self.consumer_id)
                    .await?;
                Ok(StepOutcome::Acknowledged(message.envelope.id))
            }
            Some(reason) => self.unacknowledge(&message, reason).await,
        }
    }

    /// Run the handler; `None` means success
    async fn invoke(&self, message: &StoredMessage) -> Option<UnacknowledgementReason> {
        let id = message.id();
        let handler = Arc::clone(&self.handler);
        let envelope = message.envelope.clone();
        let mut task = tokio::spawn(async move { handler.handle(&envelope).await });

        let joined = match message.envelope.message.consume_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    tracing::warn!("Message {} timed out after {:?}", id, limit);
                    return Some(UnacknowledgementReason::Timeout);
                }
            },
            None => (&mut task).await,
        };

        match joined {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                tracing::warn!("Handler failed for message {}: {}", id, e);
                Some(UnacknowledgementReason::HandlerError)
            }
            Err(e) => {
                tracing::error!("Handler panicked for message {}: {}", id, e);
                Some(UnacknowledgementReason::HandlerError)
            }
        }
    }

    async fn unacknowledge(
        &self,
        message: &StoredMessage,
        reason: UnacknowledgementReason,
    ) -> Result<StepOutcome> {
        let action = self
            .lifecycle
            .unacknowledge(message, &self.processing_key, &self.consumer_id, reason)
            .await?;
        Ok(StepOutcome::Unacknowledged {
            id: message.envelope.id.clone(),
            reason,
            action,
        })
    }

    /// One step, returning how long to wait before the next one
    pub(crate) async fn tick(&self, poll_interval: Duration) -> Option<Duration> {
        match self.step().await {
            Ok(StepOutcome::Empty) => Some(poll_interval),
            Ok(StepOutcome::RateLimited(wait)) => {
                tracing::trace!("Queue {} rate limited for {:?}", self.queue, wait);
                Some(wait)
            }
            Ok(_) => None,
            Err(Error::ForbiddenOperation { .. }) => Some(poll_interval),
            Err(e) => {
                tracing::warn!("Consuming {} failed: {}", self.queue, e);
                Some(ERROR_BACKOFF)
            }
        }
    }

    /// Step until cancelled
    ///
    /// Cancellation is observed between steps so a running handler always
    /// completes.
    pub(crate) async fn run(self: Arc<Self>, token: CancellationToken, poll_interval: Duration) {
        tracing::debug!("Runner for {} started", self.queue);
        while !token.is_cancelled() {
            if let Some(wait) = self.tick(poll_interval).await {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
        tracing::debug!("Runner for {} stopped", self.queue);
    }
}

/// Step several runners in turn on the current task
///
/// `runners` is asked for the current set before every round so runners can
/// be added or removed while the loop runs.
pub(crate) async fn run_multiplexed<F>(runners: F, token: CancellationToken, poll_interval: Duration)
where
    F: Fn() -> Vec<Arc<MessageHandlerRunner>> + Send + 'static,
{
    tracing::debug!("Multiplexed runner started");
    while !token.is_cancelled() {
        let mut idle_for: Option<Duration> = None;
        let mut busy = false;
        for runner in runners() {
            if token.is_cancelled() {
                break;
            }
            match runner.tick(poll_interval).await {
                None => busy = true,
                Some(wait) => idle_for = Some(idle_for.map_or(wait, |w| w.min(wait))),
            }
        }
        if busy {
            continue;
        }
        let wait = idle_for.unwrap_or(poll_interval);
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    tracing::debug!("Multiplexed runner stopped");
}
