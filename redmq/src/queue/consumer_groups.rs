//! Consumer groups of PUB_SUB queues

use super::{QueueOperation, QueueParams};
use crate::context::Context;
use crate::events::Event;
use crate::storage::keys::validate_name;
use crate::storage::{LuaScript, QueueKeys};
use crate::{Error, Result};

/// Consumer group management
#[derive(Debug, Clone)]
pub struct ConsumerGroups {
    ctx: Context,
}

impl ConsumerGroups {
    /// Create a consumer group manager
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Add a consumer group to a PUB_SUB queue
    ///
    /// Returns `true` when the group did not exist before.
    pub async fn save(&self, queue: &QueueParams, group: &str) -> Result<bool> {
        let group = validate_name(group)
            .map_err(|e| Error::Validation(format!("consumer group: {}", e)))?;
        let keys = QueueKeys::new(queue);
        let reply = self
            .ctx
            .redis
            .eval_script(
                LuaScript::SaveConsumerGroup,
                vec![keys.properties, keys.consumer_groups],
                vec![
                    QueueOperation::CreateConsumerGroup.mask_arg().into(),
                    group.as_str().into(),
                ],
            )
            .await?
            .check(&queue.to_string(), Some(QueueOperation::CreateConsumerGroup))?;

        let created = reply.int(0) == 1;
        if created {
            tracing::info!("Consumer group {} created on queue {}", group, queue);
            self.ctx.events.emit(Event::ConsumerGroupCreated {
                queue: queue.clone(),
                group,
            });
        }
        Ok(created)
    }

    /// Remove a consumer group whose pending list is empty
    pub async fn delete(&self, queue: &QueueParams, group: &str) -> Result<()> {
        let group = validate_name(group)
            .map_err(|e| Error::Validation(format!("consumer group: {}", e)))?;
        let keys = QueueKeys::new(queue);
        self.ctx
            .redis
            .eval_script(
                LuaScript::DeleteConsumerGroup,
                vec![
                    keys.properties.clone(),
                    keys.consumer_groups.clone(),
                    keys.pending(Some(&group)),
                ],
                vec![
                    QueueOperation::DeleteConsumerGroup.mask_arg().into(),
                    group.as_str().into(),
                ],
            )
            .await?
            .check(&queue.to_string(), Some(QueueOperation::DeleteConsumerGroup))?;

        tracing::info!("Consumer group {} deleted from queue {}", group, queue);
        self.ctx.events.emit(Event::ConsumerGroupDeleted {
            queue: queue.clone(),
            group,
        });
        Ok(())
    }

    /// Consumer groups of a queue, sorted
    pub async fn list(&self, queue: &QueueParams) -> Result<Vec<String>> {
        let keys = QueueKeys::new(queue);
        let mut groups = self.ctx.redis.smembers(&keys.consumer_groups).await?;
        groups.sort();
        Ok(groups)
    }

    /// Whether `group` exists on the queue
    pub async fn exists(&self, queue: &QueueParams, group: &str) -> Result<bool> {
        let keys = QueueKeys::new(queue);
        self.ctx.redis.sismember(&keys.consumer_groups, group).await
    }
}
