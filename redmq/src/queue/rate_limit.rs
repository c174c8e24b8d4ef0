//! Queue rate limiting
//!
//! A fixed window counter per queue. The window starts with the first
//! delivery and expires after `interval_ms`; once `limit` deliveries were
//! counted in the window, dequeues report the remaining window instead of a
//! message.

use super::{QueueOperation, QueueParams, QueueProperties};
use crate::context::Context;
use crate::storage::{LuaScript, QueueKeys};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest accepted window
pub const MIN_RATE_LIMIT_INTERVAL_MS: u64 = 1000;

/// Rate limit of a queue: at most `limit` messages per `interval_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRateLimitParams {
    /// Messages per window
    pub limit: u64,
    /// Window length in milliseconds
    pub interval_ms: u64,
}

impl QueueRateLimitParams {
    /// Build and validate rate limit parameters
    pub fn new(limit: u64, interval: Duration) -> Result<Self> {
        let params = Self {
            limit,
            interval_ms: interval.as_millis() as u64,
        };
        params.validate()?;
        Ok(params)
    }

    /// Check `limit > 0` and `interval >= 1000 ms`
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(Error::Validation(
                "rate limit must be greater than 0".into(),
            ));
        }
        if self.interval_ms < MIN_RATE_LIMIT_INTERVAL_MS {
            return Err(Error::Validation(format!(
                "rate limit interval must be at least {} ms",
                MIN_RATE_LIMIT_INTERVAL_MS
            )));
        }
        Ok(())
    }
}

/// Outcome of [`QueueRateLimit::has_exceeded`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Whether the window is exhausted
    pub exceeded: bool,
    /// Remaining window when exceeded
    pub retry_after: Duration,
}

/// Rate limit operations
#[derive(Debug, Clone)]
pub struct QueueRateLimit {
    ctx: Context,
}

impl QueueRateLimit {
    /// Create a rate limit manager
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Set the rate limit of a queue, resetting the current window
    pub async fn set(&self, queue: &QueueParams, params: QueueRateLimitParams) -> Result<()> {
        params.validate()?;
        self.run(
            queue,
            QueueOperation::SetRateLimit,
            params.limit,
            params.interval_ms,
        )
        .await?;
        tracing::info!(
            "Rate limit of queue {} set to {} per {} ms",
            queue,
            params.limit,
            params.interval_ms
        );
        Ok(())
    }

    /// Current rate limit of a queue
    pub async fn get(&self, queue: &QueueParams) -> Result<Option<QueueRateLimitParams>> {
        let keys = QueueKeys::new(queue);
        let hash = self.ctx.redis.hgetall(&keys.properties).await?;
        if hash.is_empty() {
            return Err(Error::QueueNotFound(queue.to_string()));
        }
        Ok(QueueProperties::from_hash(&hash)?.rate_limit)
    }

    /// Remove the rate limit of a queue
    pub async fn clear(&self, queue: &QueueParams) -> Result<()> {
        self.run(queue, QueueOperation::ClearRateLimit, 0, 0).await?;
        tracing::info!("Rate limit of queue {} cleared", queue);
        Ok(())
    }

    /// Count one message against the window and report whether it was
    /// already exhausted
    ///
    /// When the window is exhausted nothing is counted.
    pub async fn has_exceeded(&self, queue: &QueueParams) -> Result<RateLimitStatus> {
        let keys = QueueKeys::new(queue);
        let reply = self
            .ctx
            .redis
            .eval_script(
                LuaScript::CheckRateLimit,
                vec![keys.properties, keys.rate_limit_counter],
                vec![],
            )
            .await?
            .check(&queue.to_string(), None)?;

        Ok(RateLimitStatus {
            exceeded: reply.int(0) == 1,
            retry_after: Duration::from_millis(reply.int(1).max(0) as u64),
        })
    }

    async fn run(
        &self,
        queue: &QueueParams,
        operation: QueueOperation,
        limit: u64,
        interval_ms: u64,
    ) -> Result<()> {
        let keys = QueueKeys::new(queue);
        self.ctx
            .redis
            .eval_script(
                LuaScript::SetRateLimit,
                vec![keys.properties, keys.rate_limit_counter],
                vec![
                    operation.mask_arg().into(),
                    limit.to_string().into(),
                    interval_ms.to_string().into(),
                ],
            )
            .await?
            .check(&queue.to_string(), Some(operation))?;
        Ok(())
    }
}
