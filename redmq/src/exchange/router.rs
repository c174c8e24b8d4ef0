//! Resolution of a message destination to queues

use super::{ExchangeDirect, ExchangeFanout, ExchangeParams, ExchangeTopic};
use crate::context::Context;
use crate::message::MessageDestination;
use crate::queue::QueueParams;
use crate::Result;

/// Resolves destinations through the exchanges
#[derive(Debug, Clone)]
pub struct ExchangeRouter {
    direct: ExchangeDirect,
    topic: ExchangeTopic,
    fanout: ExchangeFanout,
}

impl ExchangeRouter {
    /// Create a router
    pub fn new(ctx: Context) -> Self {
        Self {
            direct: ExchangeDirect::new(ctx.clone()),
            topic: ExchangeTopic::new(ctx.clone()),
            fanout: ExchangeFanout::new(ctx),
        }
    }

    /// Destination queues, sorted and without duplicates
    ///
    /// An exchange without matching bindings resolves to an empty list.
    pub async fn resolve(&self, destination: &MessageDestination) -> Result<Vec<QueueParams>> {
        match destination {
            MessageDestination::Queue { queue } => {
                Ok(vec![QueueParams::validated(&queue.namespace, &queue.name)?])
            }
            MessageDestination::Direct {
                exchange,
                routing_key,
            } => self.direct.get_queues(&normalized(exchange)?, routing_key).await,
            MessageDestination::Topic { exchange, topic } => {
                self.topic.get_queues(&normalized(exchange)?, topic).await
            }
            MessageDestination::Fanout { exchange } => {
                self.fanout.get_queues(&normalized(exchange)?).await
            }
        }
    }
}

fn normalized(exchange: &ExchangeParams) -> Result<ExchangeParams> {
    ExchangeParams::validated(&exchange.namespace, &exchange.name)
}
