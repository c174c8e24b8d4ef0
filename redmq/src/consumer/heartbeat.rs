//! Consumer liveness
//!
//! A live consumer keeps a short-lived heartbeat key refreshed and is listed
//! in the global consumers set and in the consumers set of every queue it
//! reads. The reaper treats a listed consumer without a heartbeat key as
//! offline.

use crate::context::Context;
use crate::events::{Event, InstanceKind};
use crate::queue::QueueParams;
use crate::storage::{now_millis, Keys, QueueKeys, RedisClient};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Consecutive failed beats before the consumer gives up
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Stored heartbeat record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Consumer id
    pub consumer_id: String,
    /// Time of the beat (ms)
    pub timestamp: i64,
    /// Process id of the consumer
    pub pid: u32,
    /// Queues read by the consumer (`name@namespace`)
    pub queues: Vec<String>,
}

/// Heartbeat of one consumer
#[derive(Debug, Clone)]
pub struct Heartbeat {
    ctx: Context,
    consumer_id: String,
    interval: Duration,
    ttl: Duration,
}

impl Heartbeat {
    /// Create a heartbeat
    pub fn new(ctx: Context, consumer_id: impl Into<String>, interval: Duration, ttl: Duration) -> Self {
        Self {
            ctx,
            consumer_id: consumer_id.into(),
            interval,
            ttl,
        }
    }

    /// Write a first beat and list the consumer
    ///
    /// The beat goes first so the reaper never sees a listed consumer
    /// without a heartbeat.
    pub async fn register(&self, queues: &[QueueParams]) -> Result<()> {
        self.beat(queues).await?;
        self.ctx
            .redis
            .sadd(&Keys::consumers(), &self.consumer_id)
            .await?;
        for queue in queues {
            self.register_queue(queue).await?;
        }
        tracing::debug!("Consumer {} registered", self.consumer_id);
        Ok(())
    }

    /// Add the consumer to one queue's consumers set
    pub async fn register_queue(&self, queue: &QueueParams) -> Result<()> {
        self.ctx
            .redis
            .sadd(&QueueKeys::new(queue).consumers, &self.consumer_id)
            .await?;
        Ok(())
    }

    /// Remove the consumer from one queue's consumers set
    pub async fn unregister_queue(&self, queue: &QueueParams) -> Result<()> {
        self.ctx
            .redis
            .srem(&QueueKeys::new(queue).consumers, &self.consumer_id)
            .await?;
        Ok(())
    }

    /// Remove every registration and the heartbeat key
    pub async fn unregister(&self, queues: &[QueueParams]) -> Result<()> {
        let redis = &self.ctx.redis;
        for queue in queues {
            self.unregister_queue(queue).await?;
        }
        redis.srem(&Keys::consumers(), &self.consumer_id).await?;
        redis
            .del(vec![
                Keys::consumer_heartbeat(&self.consumer_id),
                Keys::consumer_processing(&self.consumer_id),
            ])
            .await?;
        tracing::debug!("Consumer {} unregistered", self.consumer_id);
        Ok(())
    }

    /// Write one heartbeat
    pub async fn beat(&self, queues: &[QueueParams]) -> Result<()> {
        let payload = HeartbeatPayload {
            consumer_id: self.consumer_id.clone(),
            timestamp: now_millis(),
            pid: std::process::id(),
            queues: queues.iter().map(QueueParams::id).collect(),
        };
        let json =
            serde_json::to_string(&payload).map_err(|e| Error::Serialization(e.to_string()))?;
        let ttl = ttl_millis(self.ttl);
        self.ctx
            .redis
            .set_px(&Keys::consumer_heartbeat(&self.consumer_id), &json, ttl)
            .await?;
        tracing::trace!("Heartbeat updated for consumer {}, TTL: {}ms", self.consumer_id, ttl);
        Ok(())
    }

    /// Beat every interval until `token` is cancelled
    ///
    /// `queues` is called before each beat. After
    /// [`MAX_CONSECUTIVE_FAILURES`] failed beats in a row an
    /// [`Event::Error`] is emitted and `failed` is cancelled.
    pub(crate) fn spawn<F>(
        self,
        queues: F,
        token: CancellationToken,
        failed: CancellationToken,
    ) -> JoinHandle<()>
    where
        F: Fn() -> Vec<QueueParams> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.interval);
            timer.tick().await;
            let mut failures = 0;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = timer.tick() => {}
                }

                match self.beat(&queues()).await {
                    Ok(()) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        tracing::error!(
                            "Heartbeat failed for consumer {} ({}/{}): {}",
                            self.consumer_id,
                            failures,
                            MAX_CONSECUTIVE_FAILURES,
                            e
                        );
                        if failures >= MAX_CONSECUTIVE_FAILURES {
                            self.ctx.events.emit(Event::Error {
                                kind: InstanceKind::Consumer,
                                id: self.consumer_id.clone(),
                                message: format!("heartbeat failed: {}", e),
                            });
                            failed.cancel();
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Whether `consumer_id` has a live heartbeat
    pub async fn is_alive(redis: &RedisClient, consumer_id: &str) -> Result<bool> {
        redis.exists(&Keys::consumer_heartbeat(consumer_id)).await
    }

    /// Stored heartbeat of `consumer_id`, if alive
    pub async fn payload(redis: &RedisClient, consumer_id: &str) -> Result<Option<HeartbeatPayload>> {
        match redis.get(&Keys::consumer_heartbeat(consumer_id)).await? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| Error::Serialization(e.to_string())),
            None => Ok(None),
        }
    }
}

/// Heartbeat key expiry in milliseconds, never zero
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}
