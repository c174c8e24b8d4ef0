//! Redis Key manager
//!
//! Provides unified Redis key naming convention. Every function here is pure:
//! the same entity always maps to the same key.

use crate::exchange::ExchangeParams;
use crate::queue::QueueParams;
use once_cell::sync::Lazy;
use regex::Regex;

/// Redis Key prefix
const PREFIX: &str = "redmq";

static NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+([._-][a-z0-9]+)*$").expect("static name pattern is valid")
});

/// Validate and normalize a queue, exchange, namespace or consumer group name
///
/// Names are lowercased; they may contain `a-z`, `0-9` and single `.`, `_` or
/// `-` separators between alphanumeric runs.
pub fn validate_name(name: &str) -> Result<String, String> {
    let lowered = name.trim().to_lowercase();
    if lowered.is_empty() {
        return Err("name cannot be empty".to_string());
    }
    if !NAME_RE.is_match(&lowered) {
        return Err(format!("invalid name '{}'", name));
    }
    Ok(lowered)
}

/// Global Redis keys
#[derive(Debug, Clone)]
pub struct Keys;

impl Keys {
    /// All namespaces (Set)
    /// Example: redmq:global:namespaces
    pub fn namespaces() -> String {
        format!("{}:global:namespaces", PREFIX)
    }

    /// All queues as `name@namespace` (Set)
    pub fn queues() -> String {
        format!("{}:global:queues", PREFIX)
    }

    /// Queues of a namespace (Set of names)
    /// Example: redmq:ns:shop:queues
    pub fn namespace_queues(namespace: &str) -> String {
        format!("{}:ns:{}:queues", PREFIX, namespace)
    }

    /// Exchanges of a namespace (Set of `type:name`)
    pub fn namespace_exchanges(namespace: &str) -> String {
        format!("{}:ns:{}:exchanges", PREFIX, namespace)
    }

    /// Registered consumers (Set of consumer ids)
    pub fn consumers() -> String {
        format!("{}:global:consumers", PREFIX)
    }

    /// Consumer heartbeat (String with TTL)
    /// Example: redmq:global:consumer:9f1c...:heartbeat
    pub fn consumer_heartbeat(consumer_id: &str) -> String {
        format!("{}:global:consumer:{}:heartbeat", PREFIX, consumer_id)
    }

    /// Processing lists owned by a consumer (Hash: processing key -> queue id)
    pub fn consumer_processing(consumer_id: &str) -> String {
        format!("{}:global:consumer:{}:processing", PREFIX, consumer_id)
    }

    /// Message detail (Hash)
    /// Example: redmq:global:message:a1b2c3d4-...
    pub fn message(message_id: &str) -> String {
        format!("{}{}", Self::message_prefix(), message_id)
    }

    /// Prefix of message keys, used by scripts that address messages by id
    pub fn message_prefix() -> String {
        format!("{}:global:message:", PREFIX)
    }

    /// Background worker lock (String with TTL)
    pub fn worker_lock(worker: &str) -> String {
        format!("{}:global:lock:{}", PREFIX, worker)
    }

    /// Purged containers awaiting collection (Hash: garbage key -> messages set key)
    pub fn gc_registry() -> String {
        format!("{}:global:gc", PREFIX)
    }

    /// A purged container renamed out of its queue
    pub fn gc_garbage(token: &str) -> String {
        format!("{}:global:gc:{}", PREFIX, token)
    }
}

/// Keys belonging to one queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    base: String,
    /// Queue properties (Hash)
    pub properties: String,
    /// Consumer groups of a PUB_SUB queue (Set)
    pub consumer_groups: String,
    /// Consumers attached to the queue (Set of consumer ids)
    pub consumers: String,
    /// Processing lists of the queue (Set of processing keys)
    pub processing_queues: String,
    /// Every message id stored for the queue (Set)
    pub messages: String,
    /// Acknowledged messages (List)
    pub acknowledged: String,
    /// Dead-lettered messages (List)
    pub dead_lettered: String,
    /// Scheduled and delayed messages (ZSet scored by due time in ms)
    pub scheduled: String,
    /// Rate limit window counter (String with TTL)
    pub rate_limit_counter: String,
    /// Insertion sequence for priority tie-breaks (String counter)
    pub priority_sequence: String,
    /// Exchanges the queue is bound to (Set of `type:name@namespace`)
    pub exchanges: String,
}

impl QueueKeys {
    /// Build the key set of a queue
    pub fn new(queue: &QueueParams) -> Self {
        let base = format!("{}:ns:{}:queue:{}", PREFIX, queue.namespace, queue.name);
        Self {
            properties: format!("{}:properties", base),
            consumer_groups: format!("{}:consumer-groups", base),
            consumers: format!("{}:consumers", base),
            processing_queues: format!("{}:processing-queues", base),
            messages: format!("{}:messages", base),
            acknowledged: format!("{}:acknowledged", base),
            dead_lettered: format!("{}:dead-lettered", base),
            scheduled: format!("{}:scheduled", base),
            rate_limit_counter: format!("{}:rate-limit", base),
            priority_sequence: format!("{}:priority-seq", base),
            exchanges: format!("{}:exchanges", base),
            base,
        }
    }

    /// Pending messages (List, or ZSet for priority queues)
    ///
    /// PUB_SUB queues keep one pending container per consumer group.
    pub fn pending(&self, consumer_group: Option<&str>) -> String {
        match consumer_group {
            Some(group) => format!("{}:pending:{}", self.base, group),
            None => format!("{}:pending", self.base),
        }
    }

    /// Messages held by one consumer (List)
    pub fn processing(&self, consumer_id: &str, consumer_group: Option<&str>) -> String {
        match consumer_group {
            Some(group) => format!("{}:processing:{}:{}", self.base, group, consumer_id),
            None => format!("{}:processing:{}", self.base, consumer_id),
        }
    }
}

/// Keys belonging to one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeKeys {
    base: String,
    /// Exchange properties (Hash)
    pub properties: String,
    /// Fanout bindings (Set of `name@namespace`)
    pub queues: String,
    /// Direct routing keys with at least one binding (Set)
    pub routing_keys: String,
    /// Topic binding patterns with at least one binding (Set)
    pub patterns: String,
}

impl ExchangeKeys {
    /// Build the key set of an exchange
    pub fn new(exchange: &ExchangeParams) -> Self {
        let base = format!(
            "{}:ns:{}:exchange:{}",
            PREFIX, exchange.namespace, exchange.name
        );
        Self {
            properties: format!("{}:properties", base),
            queues: format!("{}:queues", base),
            routing_keys: format!("{}:routing-keys", base),
            patterns: format!("{}:patterns", base),
            base,
        }
    }

    /// Queues bound under a direct routing key (Set)
    pub fn routing_key_queues(&self, routing_key: &str) -> String {
        format!("{}:routing-key:{}", self.base, routing_key)
    }

    /// Queues bound under a topic pattern (Set)
    pub fn pattern_queues(&self, pattern: &str) -> String {
        format!("{}:pattern:{}", self.base, pattern)
    }
}
