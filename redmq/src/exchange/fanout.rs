//! Fanout exchange: every bound queue receives every message

use super::{Bindings, ExchangeParams, ExchangeProperties, ExchangeQueuePolicy, ExchangeType};
use crate::context::Context;
use crate::queue::QueueParams;
use crate::Result;

/// Fanout exchange operations
#[derive(Debug, Clone)]
pub struct ExchangeFanout {
    bindings: Bindings,
}

impl ExchangeFanout {
    /// Create a fanout exchange manager
    pub fn new(ctx: Context) -> Self {
        Self {
            bindings: Bindings::new(ctx, ExchangeType::Fanout),
        }
    }

    /// Bind a queue, creating the exchange with the standard queue policy
    /// when needed
    pub async fn bind_queue(&self, exchange: &ExchangeParams, queue: &QueueParams) -> Result<bool> {
        self.bind_queue_with_policy(exchange, queue, ExchangeQueuePolicy::Standard)
            .await
    }

    /// Bind a queue; `policy` applies when the exchange is created by this
    /// binding
    pub async fn bind_queue_with_policy(
        &self,
        exchange: &ExchangeParams,
        queue: &QueueParams,
        policy: ExchangeQueuePolicy,
    ) -> Result<bool> {
        self.bindings.bind(exchange, queue, None, policy).await
    }

    /// Remove a binding; unknown bindings are ignored
    pub async fn unbind_queue(&self, exchange: &ExchangeParams, queue: &QueueParams) -> Result<bool> {
        self.bindings.unbind(exchange, queue, None).await
    }

    /// Bound queues
    pub async fn get_queues(&self, exchange: &ExchangeParams) -> Result<Vec<QueueParams>> {
        self.bindings.queues(exchange, None).await
    }

    /// Stored attributes
    pub async fn get_properties(&self, exchange: &ExchangeParams) -> Result<ExchangeProperties> {
        self.bindings.properties(exchange).await
    }

    /// Delete an exchange without bound queues
    pub async fn delete(&self, exchange: &ExchangeParams) -> Result<()> {
        self.bindings.delete(exchange).await
    }
}
