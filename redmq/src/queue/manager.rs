//! Queue and namespace management

use super::{
    QueueDeliveryModel, QueueOperation, QueueParams, QueueProperties, QueueType,
};
use crate::context::Context;
use crate::events::Event;
use crate::storage::keys::validate_name;
use crate::storage::{now_millis, Keys, LuaScript, QueueKeys};
use crate::{Error, Result};

/// Queue management
#[derive(Debug, Clone)]
pub struct QueueManager {
    ctx: Context,
}

impl QueueManager {
    /// Create a queue manager
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Create a queue
    ///
    /// Fails with [`Error::QueueExists`] when the queue is already there.
    /// The delivery model cannot be changed afterwards.
    pub async fn save(
        &self,
        queue: &QueueParams,
        queue_type: QueueType,
        delivery_model: QueueDeliveryModel,
    ) -> Result<QueueProperties> {
        let queue = QueueParams::validated(&queue.namespace, &queue.name)?;
        let keys = QueueKeys::new(&queue);
        self.ctx
            .redis
            .eval_script(
                LuaScript::CreateQueue,
                vec![
                    Keys::namespaces(),
                    Keys::queues(),
                    Keys::namespace_queues(&queue.namespace),
                    keys.properties.clone(),
                ],
                vec![
                    queue.namespace.as_str().into(),
                    queue.name.as_str().into(),
                    queue.id().into(),
                    queue_type.as_str().into(),
                    delivery_model.as_str().into(),
                    now_millis().to_string().into(),
                ],
            )
            .await?
            .check(&queue.to_string(), None)?;

        tracing::info!(
            "Queue {} created ({}, {})",
            queue,
            queue_type,
            delivery_model
        );
        self.ctx.events.emit(Event::QueueCreated {
            queue: queue.clone(),
            queue_type,
            delivery_model,
        });
        self.get_properties(&queue).await
    }

    /// Delete a queue
    ///
    /// Refused while the queue has pending, scheduled or in-flight messages,
    /// attached consumers or bound exchanges. Archived messages are deleted
    /// with the queue.
    pub async fn delete(&self, queue: &QueueParams) -> Result<()> {
        let keys = QueueKeys::new(queue);
        let reply = self
            .ctx
            .redis
            .eval_script(
                LuaScript::DeleteQueue,
                vec![
                    keys.properties.clone(),
                    keys.consumers.clone(),
                    keys.exchanges.clone(),
                    keys.consumer_groups.clone(),
                    keys.processing_queues.clone(),
                    keys.pending(None),
                    keys.scheduled.clone(),
                    keys.acknowledged.clone(),
                    keys.dead_lettered.clone(),
                    keys.messages.clone(),
                    keys.rate_limit_counter.clone(),
                    keys.priority_sequence.clone(),
                    Keys::queues(),
                    Keys::namespace_queues(&queue.namespace),
                    Keys::namespace_exchanges(&queue.namespace),
                    Keys::namespaces(),
                ],
                vec![
                    QueueOperation::Delete.mask_arg().into(),
                    queue.id().into(),
                    queue.name.as_str().into(),
                    queue.namespace.as_str().into(),
                    Keys::message_prefix().into(),
                    keys.pending(Some("")).into(),
                ],
            )
            .await?
            .check(&queue.to_string(), Some(QueueOperation::Delete))?;

        tracing::info!(
            "Queue {} deleted ({} archived messages removed)",
            queue,
            reply.int(0)
        );
        self.ctx.events.emit(Event::QueueDeleted {
            queue: queue.clone(),
        });
        Ok(())
    }

    /// Whether the queue exists
    pub async fn exists(&self, queue: &QueueParams) -> Result<bool> {
        self.ctx.redis.exists(&QueueKeys::new(queue).properties).await
    }

    /// Stored attributes of a queue
    pub async fn get_properties(&self, queue: &QueueParams) -> Result<QueueProperties> {
        let hash = self
            .ctx
            .redis
            .hgetall(&QueueKeys::new(queue).properties)
            .await?;
        if hash.is_empty() {
            return Err(Error::QueueNotFound(queue.to_string()));
        }
        QueueProperties::from_hash(&hash)
    }

    /// Every queue, sorted
    pub async fn list(&self) -> Result<Vec<QueueParams>> {
        let ids = self.ctx.redis.smembers(&Keys::queues()).await?;
        let mut queues = Vec::with_capacity(ids.len());
        for id in ids {
            match id.split_once('@') {
                Some((name, namespace)) => queues.push(QueueParams::new(namespace, name)),
                None => tracing::warn!("Ignoring malformed queue id {}", id),
            }
        }
        queues.sort();
        Ok(queues)
    }

    /// Queues of one namespace, sorted
    pub async fn list_in_namespace(&self, namespace: &str) -> Result<Vec<QueueParams>> {
        let namespace = validate_name(namespace)
            .map_err(|e| Error::Validation(format!("namespace: {}", e)))?;
        let mut queues: Vec<QueueParams> = self
            .ctx
            .redis
            .smembers(&Keys::namespace_queues(&namespace))
            .await?
            .into_iter()
            .map(|name| QueueParams::new(namespace.clone(), name))
            .collect();
        queues.sort();
        Ok(queues)
    }
}

/// Namespace management
#[derive(Debug, Clone)]
pub struct NamespaceManager {
    ctx: Context,
    queues: QueueManager,
}

impl NamespaceManager {
    /// Create a namespace manager
    pub fn new(ctx: Context) -> Self {
        let queues = QueueManager::new(ctx.clone());
        Self { ctx, queues }
    }

    /// Every namespace, sorted
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut namespaces = self.ctx.redis.smembers(&Keys::namespaces()).await?;
        namespaces.sort();
        Ok(namespaces)
    }

    /// Queues of a namespace
    pub async fn get_queues(&self, namespace: &str) -> Result<Vec<QueueParams>> {
        let namespace = self.ensure_exists(namespace).await?;
        self.queues.list_in_namespace(&namespace).await
    }

    /// Delete every queue of a namespace
    ///
    /// Stops at the first queue that cannot be deleted.
    pub async fn delete(&self, namespace: &str) -> Result<()> {
        let namespace = self.ensure_exists(namespace).await?;
        for queue in self.queues.list_in_namespace(&namespace).await? {
            self.queues.delete(&queue).await?;
        }
        tracing::info!("Namespace {} deleted", namespace);
        Ok(())
    }

    async fn ensure_exists(&self, namespace: &str) -> Result<String> {
        let namespace = validate_name(namespace)
            .map_err(|e| Error::Validation(format!("namespace: {}", e)))?;
        if !self
            .ctx
            .redis
            .sismember(&Keys::namespaces(), &namespace)
            .await?
        {
            return Err(Error::NamespaceNotFound(namespace));
        }
        Ok(namespace)
    }
}
