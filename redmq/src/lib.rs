//! # redmq
//!
//! redmq is a message queue broker built on Rust and Redis.
//!
//! ## Features
//!
//! - FIFO, LIFO and priority queues, grouped in namespaces
//! - Point-to-point and PUB_SUB delivery with consumer groups
//! - Direct, topic and fanout exchanges
//! - Retries with delay, dead-lettering, TTL and consume timeouts
//! - Delayed, cron and repeating messages
//! - Queue rate limits and operational states (pause, stop, lock)
//! - Broker events and Prometheus metrics
//!
//! Every state change spanning several keys runs as one Lua script, so any
//! number of producers and consumers can share one Redis server.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use redmq::message::{MessageEnvelope, ProducibleMessage};
//! use redmq::queue::{QueueDeliveryModel, QueueManager, QueueParams, QueueType};
//! use redmq::{Consumer, ConsumerConfig, Context, Producer, RedmqConfig};
//!
//! #[tokio::main]
//! async fn main() -> redmq::Result<()> {
//!     let config = RedmqConfig::new()
//!         .with_redis_url("redis://localhost:6379")
//!         .with_namespace("shop");
//!     let ctx = Context::connect(config).await?;
//!
//!     let orders = QueueParams::new("shop", "orders");
//!     QueueManager::new(ctx.clone())
//!         .save(&orders, QueueType::Fifo, QueueDeliveryModel::PointToPoint)
//!         .await?;
//!
//!     // Producer side
//!     let producer = Producer::new(ctx.clone());
//!     producer.run().await?;
//!     let message = ProducibleMessage::builder()
//!         .queue(orders.clone())
//!         .body(&"order #1")?
//!         .build()?;
//!     producer.produce(&message).await?;
//!
//!     // Consumer side
//!     let consumer = Consumer::new(ctx.clone(), ConsumerConfig::default());
//!     consumer
//!         .consume(&orders, None, |message: MessageEnvelope| async move {
//!             let order: String = message.body()?;
//!             println!("processing {}", order);
//!             Ok::<_, redmq::Error>(())
//!         })
//!         .await?;
//!     consumer.run().await?;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     consumer.shutdown().await?;
//!     producer.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Errors and configuration
pub mod config;
pub mod error;
pub mod logger;

// Shared runtime
pub mod context;
pub mod events;
pub mod power_switch;

// Storage layer
pub mod storage;

// Broker model
pub mod exchange;
pub mod message;
pub mod queue;

// Producer and consumer
pub mod consumer;
pub mod producer;

// Background workers
pub mod workers;

// Observability
pub mod observability;

// Re-export common types
pub use config::RedmqConfig;
pub use consumer::{Consumer, ConsumerConfig, MessageHandler};
pub use context::Context;
pub use error::{Error, Result};
pub use events::{Event, EventBus};
pub use producer::Producer;
