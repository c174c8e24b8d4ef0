//! Browsing and purging the message containers of a queue
//!
//! Each container is backed by one of the [`MessageStorage`] kinds. Listing
//! is paged; purging renames the whole container to a garbage key in one
//! script and leaves the message hashes to the garbage collector.

use super::{QueueOperation, QueueParams, QueueType};
use crate::context::Context;
use crate::message::StoredMessage;
use crate::storage::{Keys, LuaScript, QueueKeys, RedisClient};
use crate::{Error, Result};
use serde::Serialize;

/// Redis structure holding message ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStorage {
    /// List (FIFO/LIFO pending, acknowledged, dead-lettered)
    List,
    /// Set (all messages of a queue)
    Set,
    /// Sorted set (priority pending, scheduled)
    SortedSet,
}

impl MessageStorage {
    /// Number of ids in `key`
    pub async fn count(&self, redis: &RedisClient, key: &str) -> Result<u64> {
        match self {
            Self::List => redis.llen(key).await,
            Self::Set => redis.scard(key).await,
            Self::SortedSet => redis.zcard(key).await,
        }
    }

    /// Ids of one page, pages start at 1
    ///
    /// Set members have no order of their own and are sorted first.
    pub async fn page_ids(
        &self,
        redis: &RedisClient,
        key: &str,
        page: u64,
        page_size: u64,
    ) -> Result<Vec<String>> {
        let page = page.max(1);
        let start = ((page - 1) * page_size) as i64;
        let stop = start + page_size as i64 - 1;
        match self {
            Self::List => redis.lrange(key, start, stop).await,
            Self::SortedSet => redis.zrange(key, start, stop).await,
            Self::Set => {
                let mut ids = redis.smembers(key).await?;
                ids.sort();
                Ok(ids
                    .into_iter()
                    .skip(start as usize)
                    .take(page_size as usize)
                    .collect())
            }
        }
    }
}

/// One page of messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePage {
    /// Page number, starting at 1
    pub page: u64,
    /// Requested page size
    pub page_size: u64,
    /// Ids in the whole container
    pub total: u64,
    /// Messages of the page
    pub items: Vec<StoredMessage>,
}

/// Per-container message counts of a queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueMessageCounts {
    /// Pending, summed over consumer groups
    pub pending: u64,
    /// Scheduled and delayed
    pub scheduled: u64,
    /// Acknowledged archive
    pub acknowledged: u64,
    /// Dead-letter archive
    pub dead_lettered: u64,
    /// Every stored message
    pub total: u64,
}

#[derive(Debug, Clone, Copy)]
enum Container {
    Pending,
    Scheduled,
    Acknowledged,
    DeadLettered,
}

/// Message containers of queues
#[derive(Debug, Clone)]
pub struct QueueMessages {
    ctx: Context,
}

impl QueueMessages {
    /// Create a browser
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Counts of every container
    pub async fn counts(&self, queue: &QueueParams) -> Result<QueueMessageCounts> {
        let keys = QueueKeys::new(queue);
        let pending_storage = self.pending_storage(queue).await?;
        let redis = &self.ctx.redis;

        let mut pending = pending_storage.count(redis, &keys.pending(None)).await?;
        for group in redis.smembers(&keys.consumer_groups).await? {
            pending += pending_storage.count(redis, &keys.pending(Some(&group))).await?;
        }

        Ok(QueueMessageCounts {
            pending,
            scheduled: MessageStorage::SortedSet.count(redis, &keys.scheduled).await?,
            acknowledged: MessageStorage::List.count(redis, &keys.acknowledged).await?,
            dead_lettered: MessageStorage::List.count(redis, &keys.dead_lettered).await?,
            total: MessageStorage::Set.count(redis, &keys.messages).await?,
        })
    }

    /// Pending messages of the queue or of one consumer group
    pub async fn count_pending(&self, queue: &QueueParams, group: Option<&str>) -> Result<u64> {
        let storage = self.pending_storage(queue).await?;
        storage
            .count(&self.ctx.redis, &QueueKeys::new(queue).pending(group))
            .await
    }

    /// A page of pending messages
    pub async fn get_pending(
        &self,
        queue: &QueueParams,
        group: Option<&str>,
        page: u64,
        page_size: u64,
    ) -> Result<MessagePage> {
        let storage = self.pending_storage(queue).await?;
        let key = QueueKeys::new(queue).pending(group);
        self.page(storage, &key, page, page_size).await
    }

    /// A page of scheduled messages, earliest first
    pub async fn get_scheduled(
        &self,
        queue: &QueueParams,
        page: u64,
        page_size: u64,
    ) -> Result<MessagePage> {
        let key = QueueKeys::new(queue).scheduled;
        self.page(MessageStorage::SortedSet, &key, page, page_size).await
    }

    /// A page of acknowledged messages, latest first
    pub async fn get_acknowledged(
        &self,
        queue: &QueueParams,
        page: u64,
        page_size: u64,
    ) -> Result<MessagePage> {
        let key = QueueKeys::new(queue).acknowledged;
        self.page(MessageStorage::List, &key, page, page_size).await
    }

    /// A page of dead-lettered messages, latest first
    pub async fn get_dead_lettered(
        &self,
        queue: &QueueParams,
        page: u64,
        page_size: u64,
    ) -> Result<MessagePage> {
        let key = QueueKeys::new(queue).dead_lettered;
        self.page(MessageStorage::List, &key, page, page_size).await
    }

    /// A page of every stored message of the queue
    pub async fn get_all(
        &self,
        queue: &QueueParams,
        page: u64,
        page_size: u64,
    ) -> Result<MessagePage> {
        let key = QueueKeys::new(queue).messages;
        self.page(MessageStorage::Set, &key, page, page_size).await
    }

    /// Purge the pending container of the queue or of one consumer group
    pub async fn purge_pending(&self, queue: &QueueParams, group: Option<&str>) -> Result<u64> {
        self.purge(queue, Container::Pending, group).await
    }

    /// Purge scheduled messages, periodic templates included
    pub async fn purge_scheduled(&self, queue: &QueueParams) -> Result<u64> {
        self.purge(queue, Container::Scheduled, None).await
    }

    /// Purge the acknowledged archive
    pub async fn purge_acknowledged(&self, queue: &QueueParams) -> Result<u64> {
        self.purge(queue, Container::Acknowledged, None).await
    }

    /// Purge the dead-letter archive
    pub async fn purge_dead_lettered(&self, queue: &QueueParams) -> Result<u64> {
        self.purge(queue, Container::DeadLettered, None).await
    }

    async fn purge(
        &self,
        queue: &QueueParams,
        container: Container,
        group: Option<&str>,
    ) -> Result<u64> {
        let keys = QueueKeys::new(queue);
        let container_key = match container {
            Container::Pending => keys.pending(group),
            Container::Scheduled => keys.scheduled.clone(),
            Container::Acknowledged => keys.acknowledged.clone(),
            Container::DeadLettered => keys.dead_lettered.clone(),
        };
        let garbage = Keys::gc_garbage(&uuid::Uuid::new_v4().to_string());

        let reply = self
            .ctx
            .redis
            .eval_script(
                LuaScript::PurgeContainer,
                vec![
                    keys.properties.clone(),
                    container_key,
                    Keys::gc_registry(),
                    garbage,
                    keys.messages.clone(),
                ],
                vec![QueueOperation::Purge.mask_arg().into()],
            )
            .await?
            .check(&queue.to_string(), Some(QueueOperation::Purge))?;

        let count = reply.int(0).max(0) as u64;
        tracing::info!("Purged {} {:?} messages of queue {}", count, container, queue);
        Ok(count)
    }

    async fn pending_storage(&self, queue: &QueueParams) -> Result<MessageStorage> {
        let queue_type = self
            .ctx
            .redis
            .hget(&QueueKeys::new(queue).properties, "type")
            .await?
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;
        Ok(match queue_type.parse()? {
            QueueType::Priority => MessageStorage::SortedSet,
            QueueType::Fifo | QueueType::Lifo => MessageStorage::List,
        })
    }

    async fn page(
        &self,
        storage: MessageStorage,
        key: &str,
        page: u64,
        page_size: u64,
    ) -> Result<MessagePage> {
        if page_size == 0 {
            return Err(Error::Validation("page size must be greater than 0".into()));
        }
        let redis = &self.ctx.redis;
        let total = storage.count(redis, key).await?;
        let ids = storage.page_ids(redis, key, page, page_size).await?;

        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            let hash = redis.hgetall(&Keys::message(&id)).await?;
            // archived hashes may have expired before being trimmed
            if hash.is_empty() {
                continue;
            }
            items.push(StoredMessage::from_hash(&hash)?);
        }

        Ok(MessagePage {
            page: page.max(1),
            page_size,
            total,
            items,
        })
    }
}
