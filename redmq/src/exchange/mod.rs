//! Exchanges
//!
//! An exchange routes a published message to the queues bound to it:
//!
//! - direct: queues bound under the exact routing key
//! - topic: queues bound with a pattern matching the topic
//! - fanout: every bound queue
//!
//! Exchanges are created on the first binding and only accept queues of
//! their own namespace whose type fits the exchange's queue policy.

pub mod direct;
pub mod fanout;
pub mod router;
pub mod topic;
pub mod topic_pattern;

pub use direct::ExchangeDirect;
pub use fanout::ExchangeFanout;
pub use router::ExchangeRouter;
pub use topic::ExchangeTopic;
pub use topic_pattern::TopicPattern;

use crate::context::Context;
use crate::queue::{QueueOperation, QueueParams, QueueType};
use crate::storage::keys::validate_name;
use crate::storage::{hash_i64, hash_str, now_millis, ExchangeKeys, Keys, LuaScript, QueueKeys};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Exchange identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExchangeParams {
    /// Namespace
    pub namespace: String,
    /// Exchange name
    pub name: String,
}

impl ExchangeParams {
    /// Build exchange params without validation
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build validated, lowercased exchange params
    pub fn validated(namespace: &str, name: &str) -> Result<Self> {
        let namespace = validate_name(namespace)
            .map_err(|e| Error::Validation(format!("namespace: {}", e)))?;
        let name = validate_name(name)
            .map_err(|e| Error::Validation(format!("exchange name: {}", e)))?;
        Ok(Self { namespace, name })
    }

    /// Parse `name@namespace`; a bare name takes `default_namespace`
    pub fn parse(value: &str, default_namespace: &str) -> Result<Self> {
        match value.split_once('@') {
            Some((name, namespace)) => Self::validated(namespace, name),
            None => Self::validated(default_namespace, value),
        }
    }

    /// `name@namespace`
    pub fn id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ExchangeParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.namespace)
    }
}

/// Routing behaviour of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeType {
    /// Exact routing key
    Direct,
    /// Topic pattern
    Topic,
    /// Every bound queue
    Fanout,
}

impl ExchangeType {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Topic => "topic",
            Self::Fanout => "fanout",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "direct" => Ok(Self::Direct),
            "topic" => Ok(Self::Topic),
            "fanout" => Ok(Self::Fanout),
            other => Err(Error::Validation(format!("unknown exchange type '{}'", other))),
        }
    }
}

/// Queue types an exchange accepts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeQueuePolicy {
    /// FIFO and LIFO queues
    #[default]
    Standard,
    /// Priority queues
    Priority,
}

impl ExchangeQueuePolicy {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Priority => "priority",
        }
    }

    /// Whether a queue of `queue_type` may be bound
    pub fn accepts(&self, queue_type: QueueType) -> bool {
        match self {
            Self::Standard => queue_type != QueueType::Priority,
            Self::Priority => queue_type == QueueType::Priority,
        }
    }
}

impl FromStr for ExchangeQueuePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "standard" => Ok(Self::Standard),
            "priority" => Ok(Self::Priority),
            other => Err(Error::Validation(format!("unknown queue policy '{}'", other))),
        }
    }
}

/// Stored attributes of an exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeProperties {
    /// Routing behaviour
    pub exchange_type: ExchangeType,
    /// Accepted queue types
    pub queue_policy: ExchangeQueuePolicy,
    /// Creation time (ms since epoch)
    pub created_at: i64,
}

/// A binding of a queue as recorded on the queue side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBinding {
    /// Exchange type
    pub exchange_type: ExchangeType,
    /// Exchange
    pub exchange: ExchangeParams,
    /// Routing key or pattern, `None` for fanout
    pub binding: Option<String>,
}

impl QueueBinding {
    fn reference(&self) -> String {
        format!(
            "{}|{}|{}",
            self.exchange_type,
            self.exchange,
            self.binding.as_deref().unwrap_or_default()
        )
    }

    fn from_reference(value: &str) -> Option<Self> {
        let mut parts = value.splitn(3, '|');
        let exchange_type = parts.next()?.parse().ok()?;
        let (name, namespace) = parts.next()?.split_once('@')?;
        let binding = parts.next()?;
        Some(Self {
            exchange_type,
            exchange: ExchangeParams::new(namespace, name),
            binding: (!binding.is_empty()).then(|| binding.to_string()),
        })
    }
}

/// Binding storage shared by the three exchange kinds
#[derive(Debug, Clone)]
pub(crate) struct Bindings {
    ctx: Context,
    exchange_type: ExchangeType,
}

impl Bindings {
    pub(crate) fn new(ctx: Context, exchange_type: ExchangeType) -> Self {
        Self { ctx, exchange_type }
    }

    pub(crate) fn ctx(&self) -> &Context {
        &self.ctx
    }

    /// Keys of the set holding queues under `binding` and of the index
    /// listing the bindings in use
    fn binding_keys(&self, keys: &ExchangeKeys, binding: Option<&str>) -> (String, String) {
        match (self.exchange_type, binding) {
            (ExchangeType::Direct, Some(key)) => {
                (keys.routing_key_queues(key), keys.routing_keys.clone())
            }
            (ExchangeType::Topic, Some(pattern)) => {
                (keys.pattern_queues(pattern), keys.patterns.clone())
            }
            _ => (keys.queues.clone(), keys.routing_keys.clone()),
        }
    }

    fn check_namespace(&self, exchange: &ExchangeParams, queue: &QueueParams) -> Result<()> {
        if exchange.namespace != queue.namespace {
            return Err(Error::Validation(format!(
                "queue {} cannot be bound to exchange {} of another namespace",
                queue, exchange
            )));
        }
        Ok(())
    }

    pub(crate) async fn bind(
        &self,
        exchange: &ExchangeParams,
        queue: &QueueParams,
        binding: Option<&str>,
        policy: ExchangeQueuePolicy,
    ) -> Result<bool> {
        let exchange = ExchangeParams::validated(&exchange.namespace, &exchange.name)?;
        let queue = QueueParams::validated(&queue.namespace, &queue.name)?;
        self.check_namespace(&exchange, &queue)?;

        let keys = ExchangeKeys::new(&exchange);
        let queue_keys = QueueKeys::new(&queue);
        let (binding_set, binding_index) = self.binding_keys(&keys, binding);
        let reference = QueueBinding {
            exchange_type: self.exchange_type,
            exchange: exchange.clone(),
            binding: binding.map(str::to_string),
        }
        .reference();

        let reply = self
            .ctx
            .redis
            .eval_script(
                LuaScript::BindQueue,
                vec![
                    queue_keys.properties,
                    queue_keys.exchanges,
                    keys.properties.clone(),
                    binding_set,
                    binding_index,
                    Keys::namespace_exchanges(&exchange.namespace),
                    Keys::namespaces(),
                ],
                vec![
                    QueueOperation::BindExchange.mask_arg().into(),
                    queue.id().into(),
                    self.exchange_type.as_str().into(),
                    policy.as_str().into(),
                    binding.unwrap_or_default().into(),
                    reference.into(),
                    self.exchange_ref(&exchange).into(),
                    exchange.namespace.as_str().into(),
                    now_millis().to_string().into(),
                ],
            )
            .await?;

        let reply = match reply.code() {
            "EXCHANGE_TYPE_MISMATCH" | "EXCHANGE_QUEUE_POLICY_MISMATCH" => {
                reply.check(&exchange.to_string(), None)?
            }
            _ => reply.check(&queue.to_string(), Some(QueueOperation::BindExchange))?,
        };

        let added = reply.int(0) == 1;
        if added {
            tracing::info!(
                "Queue {} bound to {} exchange {}{}",
                queue,
                self.exchange_type,
                exchange,
                binding.map(|b| format!(" with {}", b)).unwrap_or_default()
            );
        }
        Ok(added)
    }

    pub(crate) async fn unbind(
        &self,
        exchange: &ExchangeParams,
        queue: &QueueParams,
        binding: Option<&str>,
    ) -> Result<bool> {
        let exchange = ExchangeParams::validated(&exchange.namespace, &exchange.name)?;
        let queue = QueueParams::validated(&queue.namespace, &queue.name)?;
        let keys = ExchangeKeys::new(&exchange);
        let queue_keys = QueueKeys::new(&queue);
        let (binding_set, binding_index) = self.binding_keys(&keys, binding);
        let reference = QueueBinding {
            exchange_type: self.exchange_type,
            exchange: exchange.clone(),
            binding: binding.map(str::to_string),
        }
        .reference();

        let reply = self
            .ctx
            .redis
            .eval_script(
                LuaScript::UnbindQueue,
                vec![
                    queue_keys.properties,
                    queue_keys.exchanges,
                    binding_set,
                    binding_index,
                ],
                vec![
                    QueueOperation::UnbindExchange.mask_arg().into(),
                    queue.id().into(),
                    binding.unwrap_or_default().into(),
                    reference.into(),
                ],
            )
            .await?
            .check(&queue.to_string(), Some(QueueOperation::UnbindExchange))?;

        let removed = reply.int(0) == 1;
        if removed {
            tracing::info!("Queue {} unbound from exchange {}", queue, exchange);
        }
        Ok(removed)
    }

    /// Queues bound under `binding` (or to a fanout exchange)
    pub(crate) async fn queues(
        &self,
        exchange: &ExchangeParams,
        binding: Option<&str>,
    ) -> Result<Vec<QueueParams>> {
        let keys = ExchangeKeys::new(exchange);
        let (binding_set, _) = self.binding_keys(&keys, binding);
        let members = self.ctx.redis.smembers(&binding_set).await?;
        Ok(parse_queue_ids(members))
    }

    /// Routing keys or patterns in use
    pub(crate) async fn binding_values(&self, exchange: &ExchangeParams) -> Result<Vec<String>> {
        let keys = ExchangeKeys::new(exchange);
        let index = match self.exchange_type {
            ExchangeType::Topic => keys.patterns,
            _ => keys.routing_keys,
        };
        let mut values = self.ctx.redis.smembers(&index).await?;
        values.sort();
        Ok(values)
    }

    pub(crate) async fn properties(&self, exchange: &ExchangeParams) -> Result<ExchangeProperties> {
        get_properties(&self.ctx, exchange).await
    }

    pub(crate) async fn delete(&self, exchange: &ExchangeParams) -> Result<()> {
        let properties = self.properties(exchange).await?;
        if properties.exchange_type != self.exchange_type {
            return Err(Error::ExchangeTypeMismatch(format!(
                "{} is a {} exchange",
                exchange, properties.exchange_type
            )));
        }

        let keys = ExchangeKeys::new(exchange);
        self.ctx
            .redis
            .eval_script(
                LuaScript::DeleteExchange,
                vec![
                    keys.properties,
                    keys.queues,
                    keys.routing_keys,
                    keys.patterns,
                    Keys::namespace_exchanges(&exchange.namespace),
                ],
                vec![self.exchange_ref(exchange).into()],
            )
            .await?
            .check(&exchange.to_string(), None)?;

        tracing::info!("{} exchange {} deleted", self.exchange_type, exchange);
        Ok(())
    }

    fn exchange_ref(&self, exchange: &ExchangeParams) -> String {
        format!("{}:{}", self.exchange_type, exchange.name)
    }
}

/// Stored attributes of an exchange
pub async fn get_properties(ctx: &Context, exchange: &ExchangeParams) -> Result<ExchangeProperties> {
    let hash = ctx
        .redis
        .hgetall(&ExchangeKeys::new(exchange).properties)
        .await?;
    if hash.is_empty() {
        return Err(Error::ExchangeNotFound(exchange.to_string()));
    }
    let field = |name: &str| {
        hash_str(&hash, name)
            .ok_or_else(|| Error::Serialization(format!("exchange property '{}' missing", name)))
    };
    Ok(ExchangeProperties {
        exchange_type: field("type")?.parse()?,
        queue_policy: field("queue_policy")?.parse()?,
        created_at: hash_i64(&hash, "created_at"),
    })
}

/// Exchanges of a namespace, sorted
pub async fn list_exchanges(
    ctx: &Context,
    namespace: &str,
) -> Result<Vec<(ExchangeType, ExchangeParams)>> {
    let namespace = validate_name(namespace)
        .map_err(|e| Error::Validation(format!("namespace: {}", e)))?;
    let mut exchanges: Vec<(ExchangeType, ExchangeParams)> = ctx
        .redis
        .smembers(&Keys::namespace_exchanges(&namespace))
        .await?
        .into_iter()
        .filter_map(|member| {
            let (exchange_type, name) = member.split_once(':')?;
            Some((
                exchange_type.parse().ok()?,
                ExchangeParams::new(namespace.clone(), name),
            ))
        })
        .collect();
    exchanges.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(exchanges)
}

/// Exchange bindings of a queue
pub async fn get_queue_bindings(ctx: &Context, queue: &QueueParams) -> Result<Vec<QueueBinding>> {
    let members = ctx.redis.smembers(&QueueKeys::new(queue).exchanges).await?;
    let mut bindings: Vec<QueueBinding> = members
        .iter()
        .filter_map(|m| QueueBinding::from_reference(m))
        .collect();
    bindings.sort_by(|a, b| a.reference().cmp(&b.reference()));
    Ok(bindings)
}

pub(crate) fn parse_queue_ids(members: Vec<String>) -> Vec<QueueParams> {
    let mut queues: Vec<QueueParams> = members
        .into_iter()
        .filter_map(|id| {
            id.split_once('@')
                .map(|(name, namespace)| QueueParams::new(namespace, name))
        })
        .collect();
    queues.sort();
    queues.dedup();
    queues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_params_parse() {
        let exchange = ExchangeParams::parse("Events@Shop", "default").unwrap();
        assert_eq!(exchange, ExchangeParams::new("shop", "events"));
        assert_eq!(exchange.to_string(), "events@shop");
        assert_eq!(
            ExchangeParams::parse("events", "default").unwrap().namespace,
            "default"
        );
        assert!(ExchangeParams::parse("bad name", "default").is_err());
    }

    #[test]
    fn test_queue_policy() {
        assert!(ExchangeQueuePolicy::Standard.accepts(QueueType::Fifo));
        assert!(ExchangeQueuePolicy::Standard.accepts(QueueType::Lifo));
        assert!(!ExchangeQueuePolicy::Standard.accepts(QueueType::Priority));
        assert!(ExchangeQueuePolicy::Priority.accepts(QueueType::Priority));
        assert!(!ExchangeQueuePolicy::Priority.accepts(QueueType::Fifo));
    }

    #[test]
    fn test_binding_reference_round_trip() {
        let binding = QueueBinding {
            exchange_type: ExchangeType::Topic,
            exchange: ExchangeParams::new("shop", "events"),
            binding: Some("order.#".into()),
        };
        assert_eq!(binding.reference(), "topic|events@shop|order.#");
        assert_eq!(
            QueueBinding::from_reference(&binding.reference()),
            Some(binding)
        );

        let fanout = QueueBinding::from_reference("fanout|all@shop|").unwrap();
        assert_eq!(fanout.exchange_type, ExchangeType::Fanout);
        assert!(fanout.binding.is_none());
    }

    #[test]
    fn test_parse_queue_ids() {
        let queues = parse_queue_ids(vec![
            "b@shop".into(),
            "a@shop".into(),
            "broken".into(),
            "a@shop".into(),
        ]);
        assert_eq!(
            queues,
            vec![QueueParams::new("shop", "a"), QueueParams::new("shop", "b")]
        );
    }
}
