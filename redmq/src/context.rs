//! Shared runtime context
//!
//! Every component is built from a [`Context`]: the validated configuration,
//! the Redis pool and the event bus. Cloning a context is cheap and clones
//! share the same pool and bus.

use crate::config::RedmqConfig;
use crate::events::EventBus;
use crate::storage::RedisClient;
use crate::Result;
use std::sync::Arc;

/// Configuration, store and event bus shared by components
#[derive(Debug, Clone)]
pub struct Context {
    /// Validated configuration
    pub config: Arc<RedmqConfig>,
    /// Redis client
    pub redis: RedisClient,
    /// Event bus
    pub events: EventBus,
}

impl Context {
    /// Validate `config` and connect to Redis
    pub async fn connect(config: RedmqConfig) -> Result<Self> {
        let config = config.validate()?;
        let redis = RedisClient::new(&config.redis).await?;
        let events = EventBus::new(&config.event_bus);
        tracing::info!(
            "Connected to {} (namespace {})",
            config.redis.url,
            config.namespace
        );
        Ok(Self {
            config: Arc::new(config),
            redis,
            events,
        })
    }

    /// Build a context from parts already set up
    pub fn from_parts(config: RedmqConfig, redis: RedisClient) -> Result<Self> {
        let config = config.validate()?;
        let events = EventBus::new(&config.event_bus);
        Ok(Self {
            config: Arc::new(config),
            redis,
            events,
        })
    }

    /// Default namespace
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Close the Redis pool
    pub async fn close(&self) -> Result<()> {
        self.redis.quit().await
    }
}
