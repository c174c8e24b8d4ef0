//! Topic exchange: routing by pattern

use super::{
    parse_queue_ids, Bindings, ExchangeParams, ExchangeProperties, ExchangeQueuePolicy,
    ExchangeType, TopicPattern,
};
use crate::context::Context;
use crate::queue::QueueParams;
use crate::storage::keys::validate_name;
use crate::storage::{ExchangeKeys, Keys};
use crate::{Error, Result};

/// Topic exchange operations
#[derive(Debug, Clone)]
pub struct ExchangeTopic {
    bindings: Bindings,
}

impl ExchangeTopic {
    /// Create a topic exchange manager
    pub fn new(ctx: Context) -> Self {
        Self {
            bindings: Bindings::new(ctx, ExchangeType::Topic),
        }
    }

    /// Bind a queue with a pattern, creating the exchange with the standard
    /// queue policy when needed
    pub async fn bind_queue(
        &self,
        exchange: &ExchangeParams,
        queue: &QueueParams,
        pattern: &str,
    ) -> Result<bool> {
        self.bind_queue_with_policy(exchange, queue, pattern, ExchangeQueuePolicy::Standard)
            .await
    }

    /// Bind a queue with a pattern; `policy` applies when the exchange is
    /// created by this binding
    pub async fn bind_queue_with_policy(
        &self,
        exchange: &ExchangeParams,
        queue: &QueueParams,
        pattern: &str,
        policy: ExchangeQueuePolicy,
    ) -> Result<bool> {
        let pattern = TopicPattern::parse(pattern)?;
        self.bindings
            .bind(exchange, queue, Some(pattern.as_str()), policy)
            .await
    }

    /// Remove a binding; unknown bindings are ignored
    pub async fn unbind_queue(
        &self,
        exchange: &ExchangeParams,
        queue: &QueueParams,
        pattern: &str,
    ) -> Result<bool> {
        let pattern = TopicPattern::parse(pattern)?;
        self.bindings
            .unbind(exchange, queue, Some(pattern.as_str()))
            .await
    }

    /// Queues bound with a pattern matching `topic`
    pub async fn get_queues(&self, exchange: &ExchangeParams, topic: &str) -> Result<Vec<QueueParams>> {
        let topic = TopicPattern::normalize_topic(topic)?;
        let redis = &self.bindings.ctx().redis;
        let keys = ExchangeKeys::new(exchange);

        let mut members = Vec::new();
        for pattern in redis.smembers(&keys.patterns).await? {
            let matcher = match TopicPattern::parse(&pattern) {
                Ok(matcher) => matcher,
                Err(e) => {
                    tracing::warn!("Skipping stored pattern of {}: {}", exchange, e);
                    continue;
                }
            };
            if matcher.matches(&topic) {
                members.extend(redis.smembers(&keys.pattern_queues(&pattern)).await?);
            }
        }
        Ok(parse_queue_ids(members))
    }

    /// Bound patterns
    pub async fn get_bindings(&self, exchange: &ExchangeParams) -> Result<Vec<String>> {
        self.bindings.binding_values(exchange).await
    }

    /// Queues of `namespace` whose name matches `pattern`, bound or not
    pub async fn match_namespace_queues(
        &self,
        namespace: &str,
        pattern: &str,
    ) -> Result<Vec<QueueParams>> {
        let namespace = validate_name(namespace)
            .map_err(|e| Error::Validation(format!("namespace: {}", e)))?;
        let matcher = TopicPattern::parse(pattern)?;
        let names = self
            .bindings
            .ctx()
            .redis
            .smembers(&Keys::namespace_queues(&namespace))
            .await?;

        let mut queues: Vec<QueueParams> = names
            .into_iter()
            .filter(|name| matcher.matches(name))
            .map(|name| QueueParams::new(namespace.clone(), name))
            .collect();
        queues.sort();
        Ok(queues)
    }

    /// Stored attributes
    pub async fn get_properties(&self, exchange: &ExchangeParams) -> Result<ExchangeProperties> {
        self.bindings.properties(exchange).await
    }

    /// Delete an exchange without bindings
    pub async fn delete(&self, exchange: &ExchangeParams) -> Result<()> {
        self.bindings.delete(exchange).await
    }
}
