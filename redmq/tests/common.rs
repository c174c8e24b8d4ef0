//! Common test utilities
//!
//! Shared helper functions and fixtures for integration tests.

#![allow(dead_code)]

use redmq::config::StorageOptions;
use redmq::consumer::ConsumerConfig;
use redmq::queue::{
    ConsumerGroups, QueueDeliveryModel, QueueManager, QueueMessages, QueueParams, QueueType,
};
use redmq::workers::WorkersConfig;
use redmq::{Consumer, Context, Producer, RedmqConfig};
use std::future::Future;
use std::time::Duration;

/// Test setup structure
///
/// Connects to Redis and gives every test its own namespace.
pub struct TestSetup {
    pub ctx: Context,
    pub namespace: String,
}

impl TestSetup {
    /// Create a new test setup
    ///
    /// Acknowledged and dead-lettered messages are archived so tests can
    /// inspect them.
    pub async fn new() -> Self {
        let redis_url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let namespace = format!("test-{}", uuid::Uuid::new_v4().simple());

        let config = RedmqConfig::new()
            .with_redis_url(redis_url)
            .with_namespace(namespace.clone())
            .with_acknowledged_storage(StorageOptions::enabled())
            .with_dead_lettered_storage(StorageOptions::enabled());
        let ctx = Context::connect(config)
            .await
            .expect("Failed to connect to Redis");

        Self { ctx, namespace }
    }

    /// Queue params in the test namespace
    pub fn queue(&self, name: &str) -> QueueParams {
        QueueParams::new(self.namespace.clone(), name)
    }

    /// Create a queue in the test namespace
    pub async fn create_queue(
        &self,
        name: &str,
        queue_type: QueueType,
        delivery_model: QueueDeliveryModel,
    ) -> QueueParams {
        let queue = self.queue(name);
        QueueManager::new(self.ctx.clone())
            .save(&queue, queue_type, delivery_model)
            .await
            .expect("Failed to create queue");
        queue
    }

    /// A running producer
    pub async fn producer(&self) -> Producer {
        let producer = Producer::new(self.ctx.clone());
        producer.run().await.expect("Failed to start producer");
        producer
    }

    /// A consumer with short intervals
    pub fn consumer(&self) -> Consumer {
        Consumer::new(self.ctx.clone(), fast_consumer_config())
    }

    /// Message browser
    pub fn messages(&self) -> QueueMessages {
        QueueMessages::new(self.ctx.clone())
    }

    /// Clean up test data
    ///
    /// Purges and deletes every queue of the test namespace. Failures are
    /// ignored.
    pub async fn cleanup(&self) {
        let queues = QueueManager::new(self.ctx.clone());
        let messages = self.messages();
        let groups = ConsumerGroups::new(self.ctx.clone());
        let Ok(list) = queues.list_in_namespace(&self.namespace).await else {
            return;
        };
        for queue in list {
            let _ = messages.purge_pending(&queue, None).await;
            for group in groups.list(&queue).await.unwrap_or_default() {
                let _ = messages.purge_pending(&queue, Some(&group)).await;
            }
            let _ = messages.purge_scheduled(&queue).await;
            let _ = messages.purge_acknowledged(&queue).await;
            let _ = messages.purge_dead_lettered(&queue).await;
            let _ = queues.delete(&queue).await;
        }
    }
}

/// Consumer configuration with short intervals
pub fn fast_consumer_config() -> ConsumerConfig {
    ConsumerConfig::new()
        .heartbeat(Duration::from_millis(500), Duration::from_secs(2))
        .poll_interval(Duration::from_millis(50))
        .workers(
            WorkersConfig::default()
                .scheduled_interval(Duration::from_millis(200))
                .reaper_interval(Duration::from_millis(500))
                .gc_interval(Duration::from_millis(200)),
        )
}

/// Wait for an async condition to be true
///
/// Returns `false` if the condition was not met within `timeout`.
pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    let check_interval = Duration::from_millis(50);

    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(check_interval).await;
    }
    false
}

/// Mock handlers for testing
pub mod mock_handlers {
    use async_trait::async_trait;
    use redmq::message::MessageEnvelope;
    use redmq::MessageHandler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Handler that counts invocations
    #[derive(Clone, Default)]
    pub struct CountingHandler {
        pub count: Arc<AtomicUsize>,
    }

    impl CountingHandler {
        pub fn count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _message: &MessageEnvelope) -> redmq::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Handler that always fails and counts attempts
    #[derive(Clone, Default)]
    pub struct FailingHandler {
        pub attempts: Arc<AtomicUsize>,
    }

    impl FailingHandler {
        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle(&self, _message: &MessageEnvelope) -> redmq::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(redmq::Error::Handler("always fails".to_string()))
        }
    }

    /// Handler that records message bodies in processing order
    #[derive(Clone, Default)]
    pub struct OrderedHandler {
        pub processed: Arc<Mutex<Vec<String>>>,
    }

    impl OrderedHandler {
        pub fn processed(&self) -> Vec<String> {
            self.processed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageHandler for OrderedHandler {
        async fn handle(&self, message: &MessageEnvelope) -> redmq::Result<()> {
            let body: String = message.body()?;
            self.processed.lock().unwrap().push(body);
            Ok(())
        }
    }
}
