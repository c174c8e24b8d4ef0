//! redmq configuration module
//!
//! The broker receives its configuration as an already-parsed struct. Loading
//! it from files or environment is left to the application; every type here
//! implements `Deserialize` so any serde format can produce it.

use crate::events::EventBusConfig;
use crate::logger::LoggerConfig;
use crate::storage::RedisConfig;
use crate::storage::keys::validate_name;
use crate::{Error, Result};
use serde::Deserialize;
use std::time::Duration;

/// Default namespace for queues and exchanges
pub const DEFAULT_NAMESPACE: &str = "default";

/// Archival options for one kind of terminal message
///
/// `queue_size` of 0 keeps every message; `expire` of `None` keeps messages
/// until they are trimmed or purged.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Whether messages are archived at all
    pub store: bool,
    /// Maximum number of archived messages per queue (0 = unbounded)
    pub queue_size: u64,
    /// Lifetime of an archived message
    #[serde(with = "crate::config::duration_secs_opt")]
    pub expire: Option<Duration>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            store: false,
            queue_size: 0,
            expire: None,
        }
    }
}

impl StorageOptions {
    /// Archive every message without size or age limit
    #[must_use]
    pub fn enabled() -> Self {
        Self {
            store: true,
            ..Self::default()
        }
    }

    /// Set queue size cap
    #[must_use]
    pub fn with_queue_size(mut self, size: u64) -> Self {
        self.queue_size = size;
        self
    }

    /// Set archived message lifetime
    #[must_use]
    pub fn with_expire(mut self, expire: Duration) -> Self {
        self.expire = Some(expire);
        self
    }

    /// Expiry in whole seconds, 0 when unset
    pub(crate) fn expire_secs(&self) -> u64 {
        self.expire.map(|d| d.as_secs().max(1)).unwrap_or(0)
    }
}

/// Storage of acknowledged and dead-lettered messages
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MessageStorageConfig {
    /// Acknowledged messages
    pub acknowledged: StorageOptions,
    /// Dead-lettered messages
    pub dead_lettered: StorageOptions,
}

/// redmq configuration
///
/// Carried by [`crate::Context`] and handed to every component at
/// construction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedmqConfig {
    /// Namespace used when a queue or exchange is given without one
    pub namespace: String,

    /// Redis connection
    pub redis: RedisConfig,

    /// Logging
    pub logger: LoggerConfig,

    /// Archival of acknowledged and dead-lettered messages
    pub message_storage: MessageStorageConfig,

    /// Event bus
    pub event_bus: EventBusConfig,
}

impl Default for RedmqConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            redis: RedisConfig::default(),
            logger: LoggerConfig::default(),
            message_storage: MessageStorageConfig::default(),
            event_bus: EventBusConfig::default(),
        }
    }
}

impl RedmqConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set default namespace
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set Redis URL
    #[must_use]
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis.url = url.into();
        self
    }

    /// Set Redis connection pool size
    #[must_use]
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.redis.pool_size = size;
        self
    }

    /// Set logger configuration
    #[must_use]
    pub fn with_logger(mut self, logger: LoggerConfig) -> Self {
        self.logger = logger;
        self
    }

    /// Set acknowledged message storage
    #[must_use]
    pub fn with_acknowledged_storage(mut self, options: StorageOptions) -> Self {
        self.message_storage.acknowledged = options;
        self
    }

    /// Set dead-lettered message storage
    #[must_use]
    pub fn with_dead_lettered_storage(mut self, options: StorageOptions) -> Self {
        self.message_storage.dead_lettered = options;
        self
    }

    /// Set event bus configuration
    #[must_use]
    pub fn with_event_bus(mut self, event_bus: EventBusConfig) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Validate the configuration
    ///
    /// Normalizes the namespace to lowercase.
    pub fn validate(mut self) -> Result<Self> {
        self.namespace = validate_name(&self.namespace)
            .map_err(|e| Error::Config(format!("namespace: {}", e)))?;

        if self.redis.url.is_empty() {
            return Err(Error::Config("redis url cannot be empty".into()));
        }

        if self.redis.pool_size == 0 {
            return Err(Error::Config("redis pool_size must be greater than 0".into()));
        }

        if self.event_bus.enabled && self.event_bus.capacity == 0 {
            return Err(Error::Config("event bus capacity must be greater than 0".into()));
        }

        Ok(self)
    }
}

/// Serde helper for `Option<Duration>` expressed in seconds
pub(crate) mod duration_secs_opt {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs: Option<u64> = Option::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
