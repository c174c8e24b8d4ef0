//! Direct exchange: routing by exact key

use super::{Bindings, ExchangeParams, ExchangeProperties, ExchangeQueuePolicy, ExchangeType};
use crate::context::Context;
use crate::queue::QueueParams;
use crate::storage::keys::validate_name;
use crate::{Error, Result};

/// Direct exchange operations
#[derive(Debug, Clone)]
pub struct ExchangeDirect {
    bindings: Bindings,
}

impl ExchangeDirect {
    /// Create a direct exchange manager
    pub fn new(ctx: Context) -> Self {
        Self {
            bindings: Bindings::new(ctx, ExchangeType::Direct),
        }
    }

    /// Bind a queue under `routing_key`, creating the exchange with the
    /// standard queue policy when needed
    pub async fn bind_queue(
        &self,
        exchange: &ExchangeParams,
        queue: &QueueParams,
        routing_key: &str,
    ) -> Result<bool> {
        self.bind_queue_with_policy(exchange, queue, routing_key, ExchangeQueuePolicy::Standard)
            .await
    }

    /// Bind a queue under `routing_key`; `policy` applies when the exchange
    /// is created by this binding
    pub async fn bind_queue_with_policy(
        &self,
        exchange: &ExchangeParams,
        queue: &QueueParams,
        routing_key: &str,
        policy: ExchangeQueuePolicy,
    ) -> Result<bool> {
        let routing_key = routing_key_of(routing_key)?;
        self.bindings
            .bind(exchange, queue, Some(&routing_key), policy)
            .await
    }

    /// Remove a binding; unknown bindings are ignored
    pub async fn unbind_queue(
        &self,
        exchange: &ExchangeParams,
        queue: &QueueParams,
        routing_key: &str,
    ) -> Result<bool> {
        let routing_key = routing_key_of(routing_key)?;
        self.bindings
            .unbind(exchange, queue, Some(&routing_key))
            .await
    }

    /// Queues bound under `routing_key`
    pub async fn get_queues(
        &self,
        exchange: &ExchangeParams,
        routing_key: &str,
    ) -> Result<Vec<QueueParams>> {
        let routing_key = routing_key_of(routing_key)?;
        self.bindings.queues(exchange, Some(&routing_key)).await
    }

    /// Routing keys with at least one bound queue
    pub async fn get_routing_keys(&self, exchange: &ExchangeParams) -> Result<Vec<String>> {
        self.bindings.binding_values(exchange).await
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

fn routing_key_of(routing_key: &str) -> Result<String> {
    validate_name(routing_key).map_err(|e| Error::Validation(format!("routing key: {}", e)))
}
