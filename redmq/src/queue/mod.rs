//! Queues
//!
//! A queue is identified by `(namespace, name)` and has a type (FIFO, LIFO or
//! priority), a delivery model (point-to-point or pub/sub with consumer
//! groups) and an operational state.

pub mod consumer_groups;
pub mod manager;
pub mod messages;
pub mod rate_limit;
pub mod state;

pub use consumer_groups::ConsumerGroups;
pub use manager::{NamespaceManager, QueueManager};
pub use messages::{MessagePage, MessageStorage, QueueMessageCounts, QueueMessages};
pub use rate_limit::{QueueRateLimit, QueueRateLimitParams, RateLimitStatus};
pub use state::{
    is_operation_allowed, LockInfo, QueueOperation, QueueOperationalState, QueueStateManager,
    QueueStateTransition, STATE_TRANSITION_RULES,
};

use crate::storage::keys::validate_name;
use crate::storage::{hash_i64, hash_str};
use crate::{Error, Result};
use fred::prelude::RedisValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Queue identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueParams {
    /// Namespace
    pub namespace: String,
    /// Queue name
    pub name: String,
}

impl QueueParams {
    /// Build queue params without validation
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build validated, lowercased queue params
    pub fn validated(namespace: &str, name: &str) -> Result<Self> {
        let namespace = validate_name(namespace)
            .map_err(|e| Error::Validation(format!("namespace: {}", e)))?;
        let name =
            validate_name(name).map_err(|e| Error::Validation(format!("queue name: {}", e)))?;
        Ok(Self { namespace, name })
    }

    /// Parse `name@namespace`; a bare name takes `default_namespace`
    pub fn parse(value: &str, default_namespace: &str) -> Result<Self> {
        match value.split_once('@') {
            Some((name, namespace)) => Self::validated(namespace, name),
            None => Self::validated(default_namespace, value),
        }
    }

    /// Identifier stored in global indexes (`name@namespace`)
    pub fn id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for QueueParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.namespace)
    }
}

/// Queue ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    /// First in, first out
    Fifo,
    /// Last in, first out
    Lifo,
    /// Highest message priority first, insertion order among equals
    Priority,
}

impl QueueType {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::Lifo => "lifo",
            Self::Priority => "priority",
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fifo" => Ok(Self::Fifo),
            "lifo" => Ok(Self::Lifo),
            "priority" => Ok(Self::Priority),
            other => Err(Error::Validation(format!("unknown queue type '{}'", other))),
        }
    }
}

/// How messages of a queue reach consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueDeliveryModel {
    /// Each message is delivered to one consumer
    PointToPoint,
    /// Each consumer group receives its own copy of every message
    PubSub,
}

impl QueueDeliveryModel {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PointToPoint => "point_to_point",
            Self::PubSub => "pub_sub",
        }
    }
}

impl fmt::Display for QueueDeliveryModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueDeliveryModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "point_to_point" => Ok(Self::PointToPoint),
            "pub_sub" => Ok(Self::PubSub),
            other => Err(Error::Validation(format!(
                "unknown delivery model '{}'",
                other
            ))),
        }
    }
}

/// Stored attributes of a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueProperties {
    /// Ordering
    pub queue_type: QueueType,
    /// Delivery model, immutable after creation
    pub delivery_model: QueueDeliveryModel,
    /// Operational state
    pub state: QueueOperationalState,
    /// Lock owner while `Locked`
    pub lock_owner: Option<String>,
    /// Lock id while `Locked`
    pub lock_id: Option<String>,
    /// Rate limit, if any
    pub rate_limit: Option<QueueRateLimitParams>,
    /// Reason given for the last state change
    pub state_reason: Option<String>,
    /// Last state change (ms since epoch)
    pub state_changed_at: i64,
    /// Creation time (ms since epoch)
    pub created_at: i64,
}

impl QueueProperties {
    /// Decode the properties hash
    pub(crate) fn from_hash(hash: &HashMap<String, RedisValue>) -> Result<Self> {
        let field = |name: &str| {
            hash_str(hash, name)
                .ok_or_else(|| Error::Serialization(format!("queue property '{}' missing", name)))
        };

        let limit = hash_i64(hash, "rate_limit_limit");
        let rate_limit = (limit > 0).then(|| QueueRateLimitParams {
            limit: limit as u64,
            interval_ms: hash_i64(hash, "rate_limit_interval") as u64,
        });

        Ok(Self {
            queue_type: field("type")?.parse()?,
            delivery_model: field("delivery_model")?.parse()?,
            state: field("state")?.parse()?,
            lock_owner: hash_str(hash, "lock_owner"),
            lock_id: hash_str(hash, "lock_id"),
            rate_limit,
            state_reason: hash_str(hash, "state_reason"),
            state_changed_at: hash_i64(hash, "state_changed_at"),
            created_at: hash_i64(hash, "created_at"),
        })
    }

    /// Whether the queue uses consumer groups
    pub fn is_pub_sub(&self) -> bool {
        self.delivery_model == QueueDeliveryModel::PubSub
    }
}
