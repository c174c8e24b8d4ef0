//! Recovering messages of offline consumers

use super::BackgroundWorker;
use crate::consumer::Heartbeat;
use crate::context::Context;
use crate::message::{MessageLifecycle, UnacknowledgementReason};
use crate::queue::{QueueManager, QueueParams};
use crate::storage::{hash_str, Keys, QueueKeys};
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Finds consumers whose heartbeat expired and unacknowledges every message
/// they still hold
#[derive(Debug, Clone)]
pub struct ConsumerReaperWorker {
    ctx: Context,
    lifecycle: MessageLifecycle,
    queues: QueueManager,
    interval: Duration,
}

impl ConsumerReaperWorker {
    /// Create the worker
    pub fn new(ctx: Context, interval: Duration) -> Self {
        Self {
            lifecycle: MessageLifecycle::new(ctx.clone()),
            queues: QueueManager::new(ctx.clone()),
            ctx,
            interval,
        }
    }

    /// Consumers listed as registered but without a heartbeat
    pub async fn offline_consumers(&self) -> Result<Vec<String>> {
        let mut offline = Vec::new();
        for consumer_id in self.ctx.redis.smembers(&Keys::consumers()).await? {
            if !Heartbeat::is_alive(&self.ctx.redis, &consumer_id).await? {
                offline.push(consumer_id);
            }
        }
        Ok(offline)
    }

    /// Release everything held by `consumer_id` and drop its registrations
    ///
    /// Returns the number of messages recovered.
    pub async fn reap(&self, consumer_id: &str) -> Result<u64> {
        let redis = &self.ctx.redis;
        let index_key = Keys::consumer_processing(consumer_id);
        let index = redis.hgetall(&index_key).await?;

        let mut recovered = 0;
        for processing_key in index.keys() {
            let Some(queue_id) = hash_str(&index, processing_key) else {
                continue;
            };
            let queue = QueueParams::parse(&queue_id, self.ctx.namespace())?;
            recovered += self
                .lifecycle
                .release_processing(
                    processing_key,
                    consumer_id,
                    UnacknowledgementReason::OfflineConsumer,
                )
                .await?;
            redis
                .srem(&QueueKeys::new(&queue).processing_queues, processing_key)
                .await?;
        }

        for queue in self.queues.list().await? {
            redis.srem(&QueueKeys::new(&queue).consumers, consumer_id).await?;
        }
        let mut stale: Vec<String> = index.into_keys().collect();
        stale.push(index_key);
        redis.del(stale).await?;
        redis.srem(&Keys::consumers(), consumer_id).await?;

        tracing::info!(
            "Consumer {} is offline, {} message(s) recovered",
            consumer_id,
            recovered
        );
        Ok(recovered)
    }
}

#[async_trait]
impl BackgroundWorker for ConsumerReaperWorker {
    fn name(&self) -> &'static str {
        "consumer-reaper"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn work(&self) -> Result<u64> {
        let mut recovered = 0;
        for consumer_id in self.offline_consumers().await? {
            match self.reap(&consumer_id).await {
                Ok(count) => recovered += count,
                Err(e) => tracing::error!("Reaping consumer {} failed: {}", consumer_id, e),
            }
        }
        Ok(recovered)
    }
}
