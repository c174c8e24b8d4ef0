//! Reclaiming purged containers

use super::BackgroundWorker;
use crate::context::Context;
use crate::storage::{Keys, LuaScript};
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Batches collected from one garbage key in a single pass
const MAX_BATCHES_PER_KEY: usize = 10;

/// Deletes the message hashes of purged containers batch by batch
#[derive(Debug, Clone)]
pub struct GarbageCollectorWorker {
    ctx: Context,
    interval: Duration,
    batch_size: u64,
}

impl GarbageCollectorWorker {
    /// Create the worker
    pub fn new(ctx: Context, interval: Duration, batch_size: u64) -> Self {
        Self {
            ctx,
            interval,
            batch_size: batch_size.max(1),
        }
    }

    /// Collect one batch of `garbage_key`
    ///
    /// Returns the number of messages removed and whether the key still
    /// holds ids.
    pub async fn collect(&self, garbage_key: &str) -> Result<(u64, bool)> {
        let reply = self
            .ctx
            .redis
            .eval_script(
                LuaScript::CollectGarbage,
                vec![Keys::gc_registry(), garbage_key.to_string()],
                vec![
                    Keys::message_prefix().into(),
                    self.batch_size.to_string().into(),
                ],
            )
            .await?
            .check(garbage_key, None)?;
        Ok((reply.int(0).max(0) as u64, reply.int(1) == 1))
    }
}

#[async_trait]
impl BackgroundWorker for GarbageCollectorWorker {
    fn name(&self) -> &'static str {
        "garbage-collector"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn work(&self) -> Result<u64> {
        let registry = self.ctx.redis.hgetall(&Keys::gc_registry()).await?;
        let mut removed = 0;
        for garbage_key in registry.keys() {
            for _ in 0..MAX_BATCHES_PER_KEY {
                let (count, remaining) = self.collect(garbage_key).await?;
                removed += count;
                if !remaining {
                    tracing::debug!("Garbage {} collected", garbage_key);
                    break;
                }
            }
        }
        Ok(removed)
    }
}
