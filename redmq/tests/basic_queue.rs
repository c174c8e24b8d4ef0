//! Integration tests for queue ordering and queue management
//!
//! These tests require a running Redis server.
//! Set REDIS_URL environment variable or use default redis://localhost:6379

mod common;

use common::mock_handlers::OrderedHandler;
use common::{wait_for, TestSetup};
use redmq::message::{MessageStatus, ProducibleMessage};
use redmq::queue::{QueueDeliveryModel, QueueManager, QueueType};
use redmq::Error;
use std::collections::HashSet;
use std::time::Duration;

async fn produce_bodies(setup: &TestSetup, queue: &redmq::queue::QueueParams, bodies: &[&str]) {
    let producer = setup.producer().await;
    for body in bodies {
        let message = ProducibleMessage::builder()
            .queue(queue.clone())
            .body(body)
            .unwrap()
            .build()
            .unwrap();
        producer.produce(&message).await.unwrap();
    }
    producer.shutdown().await.unwrap();
}

async fn consume_all(setup: &TestSetup, queue: &redmq::queue::QueueParams, expected: usize) -> Vec<String> {
    let handler = OrderedHandler::default();
    let consumer = setup.consumer();
    consumer.consume(queue, None, handler.clone()).await.unwrap();
    consumer.run().await.unwrap();

    let done = wait_for(
        || {
            let handler = handler.clone();
            async move { handler.processed().len() >= expected }
        },
        Duration::from_secs(10),
    )
    .await;
    consumer.shutdown().await.unwrap();
    assert!(done, "messages were not consumed in time");
    handler.processed()
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_fifo_order() {
    let setup = TestSetup::new().await;
    let queue = setup
        .create_queue("fifo", QueueType::Fifo, QueueDeliveryModel::PointToPoint)
        .await;

    produce_bodies(&setup, &queue, &["a", "b", "c"]).await;
    assert_eq!(setup.messages().count_pending(&queue, None).await.unwrap(), 3);

    let processed = consume_all(&setup, &queue, 3).await;
    assert_eq!(processed, vec!["a", "b", "c"]);

    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_competing_consumers_receive_each_message_once() {
    let setup = TestSetup::new().await;
    let queue = setup
        .create_queue("competing", QueueType::Fifo, QueueDeliveryModel::PointToPoint)
        .await;

    let bodies: Vec<String> = (0..30).map(|i| format!("m{}", i)).collect();
    let refs: Vec<&str> = bodies.iter().map(String::as_str).collect();
    produce_bodies(&setup, &queue, &refs).await;

    let handler = OrderedHandler::default();
    let mut consumers = Vec::new();
    for _ in 0..3 {
        let consumer = setup.consumer();
        consumer.consume(&queue, None, handler.clone()).await.unwrap();
        consumers.push(consumer);
    }
    for consumer in &consumers {
        consumer.run().await.unwrap();
    }

    let done = wait_for(
        || {
            let handler = handler.clone();
            async move { handler.processed().len() >= 30 }
        },
        Duration::from_secs(10),
    )
    .await;
    // room for a duplicate delivery to show up
    tokio::time::sleep(Duration::from_millis(500)).await;
    for consumer in &consumers {
        consumer.shutdown().await.unwrap();
    }
    assert!(done, "messages were not consumed in time");

    let processed = handler.processed();
    assert_eq!(processed.len(), 30);
    let unique: HashSet<&String> = processed.iter().collect();
    assert_eq!(unique.len(), 30);
    assert_eq!(setup.messages().count_pending(&queue, None).await.unwrap(), 0);

    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_lifo_order() {
    let setup = TestSetup::new().await;
    let queue = setup
        .create_queue("lifo", QueueType::Lifo, QueueDeliveryModel::PointToPoint)
        .await;

    produce_bodies(&setup, &queue, &["a", "b", "c"]).await;
    let processed = consume_all(&setup, &queue, 3).await;
    assert_eq!(processed, vec!["c", "b", "a"]);

    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_priority_order() {
    let setup = TestSetup::new().await;
    let queue = setup
        .create_queue("urgent", QueueType::Priority, QueueDeliveryModel::PointToPoint)
        .await;

    let producer = setup.producer().await;
    for (body, priority) in [("low", 1), ("high", 7), ("medium", 4)] {
        let message = ProducibleMessage::builder()
            .queue(queue.clone())
            .body(&body)
            .unwrap()
            .priority(priority)
            .build()
            .unwrap();
        producer.produce(&message).await.unwrap();
    }

    // a priority queue rejects messages without a priority
    let unprioritized = ProducibleMessage::builder()
        .queue(queue.clone())
        .body(&"none")
        .unwrap()
        .build()
        .unwrap();
    assert!(matches!(
        producer.produce(&unprioritized).await,
        Err(Error::Validation(_))
    ));
    producer.shutdown().await.unwrap();

    let processed = consume_all(&setup, &queue, 3).await;
    assert_eq!(processed, vec!["high", "medium", "low"]);

    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_acknowledged_messages_are_archived() {
    let setup = TestSetup::new().await;
    let queue = setup
        .create_queue("archive", QueueType::Fifo, QueueDeliveryModel::PointToPoint)
        .await;

    produce_bodies(&setup, &queue, &["only"]).await;
    consume_all(&setup, &queue, 1).await;

    let messages = setup.messages();
    let archived = wait_for(
        || {
            let messages = messages.clone();
            let queue = queue.clone();
            async move { messages.counts(&queue).await.unwrap().acknowledged == 1 }
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(archived);

    let page = messages.get_acknowledged(&queue, 1, 10).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].state.status, MessageStatus::Acknowledged);
    assert_eq!(page.items[0].body::<String>().unwrap(), "only");

    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_queue_management() {
    let setup = TestSetup::new().await;
    let manager = QueueManager::new(setup.ctx.clone());
    let queue = setup
        .create_queue("managed", QueueType::Fifo, QueueDeliveryModel::PointToPoint)
        .await;

    assert!(manager.exists(&queue).await.unwrap());
    let properties = manager.get_properties(&queue).await.unwrap();
    assert_eq!(properties.queue_type, QueueType::Fifo);
    assert!(!properties.is_pub_sub());

    // creating it twice fails
    assert!(matches!(
        manager
            .save(&queue, QueueType::Lifo, QueueDeliveryModel::PointToPoint)
            .await,
        Err(Error::QueueExists(_))
    ));

    let listed = manager.list_in_namespace(&setup.namespace).await.unwrap();
    assert_eq!(listed, vec![queue.clone()]);

    produce_bodies(&setup, &queue, &["pending"]).await;
    assert!(matches!(
        manager.delete(&queue).await,
        Err(Error::QueueNotEmpty(_))
    ));

    assert_eq!(setup.messages().purge_pending(&queue, None).await.unwrap(), 1);
    manager.delete(&queue).await.unwrap();
    assert!(!manager.exists(&queue).await.unwrap());

    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_consume_unknown_queue() {
    let setup = TestSetup::new().await;
    let consumer = setup.consumer();

    let result = consumer
        .consume(&setup.queue("missing"), None, OrderedHandler::default())
        .await;
    assert!(matches!(result, Err(Error::QueueNotFound(_))));
    assert!(consumer.queues().is_empty());

    setup.cleanup().await;
}
