//! Operator access to individual messages

use super::{MessageLifecycle, MessageState, MessageStatus, StoredMessage};
use crate::context::Context;
use crate::events::Event;
use crate::queue::QueueOperation;
use crate::storage::{now_millis, Keys, LuaScript, QueueKeys};
use crate::{Error, Result};

/// Message lookup, deletion and manual requeue
#[derive(Debug, Clone)]
pub struct MessageManager {
    ctx: Context,
    lifecycle: MessageLifecycle,
}

impl MessageManager {
    /// Create a message manager
    pub fn new(ctx: Context) -> Self {
        let lifecycle = MessageLifecycle::new(ctx.clone());
        Self { ctx, lifecycle }
    }

    /// Get a message by id
    pub async fn get_by_id(&self, id: &str) -> Result<StoredMessage> {
        self.lifecycle.load(id).await
    }

    /// Get several messages, failing on the first missing one
    pub async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<StoredMessage>> {
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            messages.push(self.lifecycle.load(id).await?);
        }
        Ok(messages)
    }

    /// Get the mutable state of a message
    pub async fn get_state(&self, id: &str) -> Result<MessageState> {
        Ok(self.lifecycle.load(id).await?.state)
    }

    /// Get the status of a message
    pub async fn get_status(&self, id: &str) -> Result<MessageStatus> {
        let status = self
            .ctx
            .redis
            .hget(&Keys::message(id), "status")
            .await?
            .ok_or_else(|| Error::MessageNotFound(id.to_string()))?;
        status.parse()
    }

    /// Delete a message from wherever it is stored
    ///
    /// Messages held by a consumer cannot be deleted.
    pub async fn delete_by_id(&self, id: &str) -> Result<()> {
        let message = self.lifecycle.load(id).await?;
        let queue = &message.envelope.queue;
        let keys = QueueKeys::new(queue);

        let reply = self
            .ctx
            .redis
            .eval_script(
                LuaScript::DeleteMessage,
                vec![
                    keys.properties.clone(),
                    Keys::message(id),
                    keys.pending(message.envelope.consumer_group.as_deref()),
                    keys.scheduled.clone(),
                    keys.acknowledged.clone(),
                    keys.dead_lettered.clone(),
                    keys.messages.clone(),
                ],
                vec![QueueOperation::DeleteMessage.mask_arg().into(), id.into()],
            )
            .await?;

        let reply = match reply.code() {
            "MESSAGE_NOT_FOUND" | "MESSAGE_IN_PROCESS" => reply.check(id, None)?,
            _ => reply.check(&queue.to_string(), Some(QueueOperation::DeleteMessage))?,
        };

        tracing::info!(
            "Message {} deleted from {} (was {})",
            id,
            queue,
            reply.value(0).unwrap_or_default()
        );
        Ok(())
    }

    /// Move an acknowledged or dead-lettered message back to pending
    ///
    /// Attempts are reset.
    pub async fn requeue_by_id(&self, id: &str) -> Result<()> {
        let message = self.lifecycle.load(id).await?;
        let queue = &message.envelope.queue;
        let keys = QueueKeys::new(queue);

        let reply = self
            .ctx
            .redis
            .eval_script(
                LuaScript::RequeueMessage,
                vec![
                    keys.properties.clone(),
                    Keys::message(id),
                    keys.acknowledged.clone(),
                    keys.dead_lettered.clone(),
                    keys.pending(message.envelope.consumer_group.as_deref()),
                    keys.priority_sequence.clone(),
                ],
                vec![
                    QueueOperation::RequeueMessage.mask_arg().into(),
                    id.into(),
                    now_millis().to_string().into(),
                ],
            )
            .await?;

        match reply.code() {
            "MESSAGE_NOT_FOUND" | "MESSAGE_NOT_REQUEUABLE" => {
                reply.check(id, None)?;
            }
            _ => {
                reply.check(&queue.to_string(), Some(QueueOperation::RequeueMessage))?;
            }
        }

        tracing::info!("Message {} requeued on {}", id, queue);
        self.ctx.events.emit(Event::MessageRequeued {
            id: id.to_string(),
            queue: queue.clone(),
            consumer_group: message.envelope.consumer_group.clone(),
        });
        Ok(())
    }
}
