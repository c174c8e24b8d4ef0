//! Publishing due scheduled messages

use super::BackgroundWorker;
use crate::context::Context;
use crate::message::MessageLifecycle;
use crate::queue::{QueueManager, QueueParams};
use crate::storage::{now_millis, QueueKeys};
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Moves due delayed messages to pending and publishes copies of due
/// periodic templates
#[derive(Debug, Clone)]
pub struct ScheduledMessagesWorker {
    ctx: Context,
    lifecycle: MessageLifecycle,
    queues: QueueManager,
    interval: Duration,
    batch_size: u64,
}

impl ScheduledMessagesWorker {
    /// Create the worker
    pub fn new(ctx: Context, interval: Duration, batch_size: u64) -> Self {
        Self {
            lifecycle: MessageLifecycle::new(ctx.clone()),
            queues: QueueManager::new(ctx.clone()),
            ctx,
            interval,
            batch_size: batch_size.max(1),
        }
    }

    /// Publish up to one batch of due messages of `queue`
    pub async fn publish_due(&self, queue: &QueueParams) -> Result<u64> {
        let due = self
            .ctx
            .redis
            .zrangebyscore(
                &QueueKeys::new(queue).scheduled,
                0.0,
                now_millis() as f64,
                Some(self.batch_size as i64),
            )
            .await?;

        let mut published = 0;
        for id in due {
            if let Some(pending_id) = self.lifecycle.publish_scheduled(queue, &id).await? {
                tracing::debug!("Scheduled message {} published as {} on {}", id, pending_id, queue);
                published += 1;
            }
        }
        Ok(published)
    }
}

#[async_trait]
impl BackgroundWorker for ScheduledMessagesWorker {
    fn name(&self) -> &'static str {
        "scheduled-messages"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn work(&self) -> Result<u64> {
        let mut published = 0;
        for queue in self.queues.list().await? {
            match self.publish_due(&queue).await {
                Ok(count) => published += count,
                // paused or stopped queues keep their schedule until resumed
                Err(Error::ForbiddenOperation { .. }) | Err(Error::QueueNotFound(_)) => {}
                Err(e) => tracing::warn!("Publishing scheduled messages of {} failed: {}", queue, e),
            }
        }
        Ok(published)
    }
}
