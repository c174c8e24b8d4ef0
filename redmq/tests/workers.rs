//! Integration tests for background workers

mod common;

use common::{fast_consumer_config, TestSetup};
use redmq::message::{DequeueOutcome, MessageLifecycle, MessageManager, MessageStatus, ProducibleMessage};
use redmq::queue::{QueueDeliveryModel, QueueType};
use redmq::storage::Keys;
use redmq::workers::{
    BackgroundWorker, ConsumerReaperWorker, GarbageCollectorWorker, ScheduledMessagesWorker,
    WorkerLock,
};
use redmq::consumer::Heartbeat;
use redmq::{Consumer, Error};
use std::time::Duration;

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_gc_reclaims_purged_messages() {
    let setup = TestSetup::new().await;
    let queue = setup
        .create_queue("purged", QueueType::Fifo, QueueDeliveryModel::PointToPoint)
        .await;

    let producer = setup.producer().await;
    let mut ids = Vec::new();
    for i in 0..5 {
        let message = ProducibleMessage::builder()
            .queue(queue.clone())
            .body(&i)
            .unwrap()
            .build()
            .unwrap();
        ids.extend(producer.produce(&message).await.unwrap());
    }

    let messages = setup.messages();
    assert_eq!(messages.purge_pending(&queue, None).await.unwrap(), 5);
    let counts = messages.counts(&queue).await.unwrap();
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.total, 5);

    let gc = GarbageCollectorWorker::new(setup.ctx.clone(), Duration::from_secs(1), 2);
    let mut collected = 0;
    for _ in 0..10 {
        collected += gc.work().await.unwrap();
        if messages.counts(&queue).await.unwrap().total == 0 {
            break;
        }
    }
    assert!(collected >= 5);
    assert_eq!(messages.counts(&queue).await.unwrap().total, 0);

    let manager = MessageManager::new(setup.ctx.clone());
    assert!(matches!(
        manager.get_by_id(&ids[0]).await,
        Err(Error::MessageNotFound(_))
    ));

    producer.shutdown().await.unwrap();
    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_reaper_recovers_messages_of_offline_consumer() {
    let setup = TestSetup::new().await;
    let queue = setup
        .create_queue("orphaned", QueueType::Fifo, QueueDeliveryModel::PointToPoint)
        .await;

    let producer = setup.producer().await;
    let message = ProducibleMessage::builder()
        .queue(queue.clone())
        .body(&"in flight")
        .unwrap()
        .retry_delay(Duration::ZERO)
        .build()
        .unwrap();
    let id = producer.produce(&message).await.unwrap().remove(0);

    // a consumer that dequeued and died without a heartbeat
    let ghost = format!("ghost-{}", uuid::Uuid::new_v4().simple());
    let lifecycle = MessageLifecycle::new(setup.ctx.clone());
    let outcome = lifecycle.dequeue(&queue, None, &ghost).await.unwrap();
    assert!(matches!(outcome, DequeueOutcome::Message(_)));
    setup.ctx.redis.sadd(&Keys::consumers(), &ghost).await.unwrap();

    let manager = MessageManager::new(setup.ctx.clone());
    assert_eq!(manager.get_status(&id).await.unwrap(), MessageStatus::Processing);

    let reaper = ConsumerReaperWorker::new(setup.ctx.clone(), Duration::from_secs(1));
    assert!(reaper.offline_consumers().await.unwrap().contains(&ghost));
    assert_eq!(reaper.reap(&ghost).await.unwrap(), 1);
    assert!(!reaper.offline_consumers().await.unwrap().contains(&ghost));

    let stored = manager.get_by_id(&id).await.unwrap();
    assert_eq!(stored.state.status, MessageStatus::Pending);
    assert_eq!(stored.state.attempts, 1);
    assert_eq!(
        stored.state.last_unacknowledged_reason.as_deref(),
        Some("offline_consumer")
    );
    assert_eq!(setup.messages().count_pending(&queue, None).await.unwrap(), 1);

    producer.shutdown().await.unwrap();
    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_heartbeat_expiry_has_millisecond_precision() {
    let setup = TestSetup::new().await;
    let consumer_id = format!("beating-{}", uuid::Uuid::new_v4().simple());
    let heartbeat = Heartbeat::new(
        setup.ctx.clone(),
        consumer_id.clone(),
        Duration::from_millis(500),
        Duration::from_millis(1500),
    );
    heartbeat.beat(&[]).await.unwrap();

    let pttl = setup
        .ctx
        .redis
        .pttl(&Keys::consumer_heartbeat(&consumer_id))
        .await
        .unwrap();
    assert!(pttl > 1000 && pttl <= 1500, "unexpected pttl {}", pttl);

    heartbeat.unregister(&[]).await.unwrap();
    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_live_consumer_is_not_reaped() {
    let setup = TestSetup::new().await;
    let queue = setup
        .create_queue("watched", QueueType::Fifo, QueueDeliveryModel::PointToPoint)
        .await;

    let consumer = Consumer::new(
        setup.ctx.clone(),
        fast_consumer_config().run_background_workers(false),
    );
    consumer
        .consume(&queue, None, common::mock_handlers::CountingHandler::default())
        .await
        .unwrap();
    consumer.run().await.unwrap();

    let reaper = ConsumerReaperWorker::new(setup.ctx.clone(), Duration::from_secs(1));
    assert!(!reaper
        .offline_consumers()
        .await
        .unwrap()
        .contains(&consumer.id().to_string()));

    consumer.shutdown().await.unwrap();
    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_shutdown_returns_held_messages() {
    let setup = TestSetup::new().await;
    let queue = setup
        .create_queue("handed-back", QueueType::Fifo, QueueDeliveryModel::PointToPoint)
        .await;

    let producer = setup.producer().await;
    let message = ProducibleMessage::builder()
        .queue(queue.clone())
        .body(&"held")
        .unwrap()
        .retry_delay(Duration::ZERO)
        .build()
        .unwrap();
    let id = producer.produce(&message).await.unwrap().remove(0);

    let handler = common::mock_handlers::CountingHandler::default();
    let consumer = Consumer::new(
        setup.ctx.clone(),
        fast_consumer_config().run_background_workers(false),
    );
    consumer.consume(&queue, None, handler.clone()).await.unwrap();

    // the message sits in this consumer's processing list without a handler call
    let lifecycle = MessageLifecycle::new(setup.ctx.clone());
    let outcome = lifecycle.dequeue(&queue, None, consumer.id()).await.unwrap();
    assert!(matches!(outcome, DequeueOutcome::Message(_)));

    consumer.run().await.unwrap();
    consumer.shutdown().await.unwrap();
    assert_eq!(handler.count(), 0);

    let manager = MessageManager::new(setup.ctx.clone());
    let stored = manager.get_by_id(&id).await.unwrap();
    assert_eq!(stored.state.status, MessageStatus::Pending);
    assert_eq!(
        stored.state.last_unacknowledged_reason.as_deref(),
        Some("offline_consumer")
    );
    assert_eq!(setup.messages().count_pending(&queue, None).await.unwrap(), 1);

    let processing_queues = setup
        .ctx
        .redis
        .smembers(&redmq::storage::QueueKeys::new(&queue).processing_queues)
        .await
        .unwrap();
    assert!(processing_queues.is_empty());

    producer.shutdown().await.unwrap();
    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_scheduled_worker_publishes_due_messages() {
    let setup = TestSetup::new().await;
    let queue = setup
        .create_queue("due", QueueType::Fifo, QueueDeliveryModel::PointToPoint)
        .await;

    let producer = setup.producer().await;
    let message = ProducibleMessage::builder()
        .queue(queue.clone())
        .body(&"soon")
        .unwrap()
        .delay(Duration::from_millis(200))
        .build()
        .unwrap();
    let id = producer.produce(&message).await.unwrap().remove(0);

    let worker = ScheduledMessagesWorker::new(setup.ctx.clone(), Duration::from_secs(1), 100);
    // not due yet
    assert_eq!(worker.publish_due(&queue).await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(worker.publish_due(&queue).await.unwrap(), 1);

    let manager = MessageManager::new(setup.ctx.clone());
    assert_eq!(manager.get_status(&id).await.unwrap(), MessageStatus::Pending);
    let counts = setup.messages().counts(&queue).await.unwrap();
    assert_eq!(counts.scheduled, 0);
    assert_eq!(counts.pending, 1);

    producer.shutdown().await.unwrap();
    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_worker_lock_is_exclusive() {
    let setup = TestSetup::new().await;
    let name = format!("lock-test-{}", uuid::Uuid::new_v4().simple());

    let mut first = WorkerLock::new(setup.ctx.clone(), &name, Duration::from_secs(5));
    let mut second = WorkerLock::new(setup.ctx.clone(), &name, Duration::from_secs(5));

    first.acquire().await.unwrap();
    assert!(first.is_held());
    assert!(matches!(
        second.acquire().await,
        Err(Error::LockNotAcquired(_))
    ));
    assert!(!second.is_held());

    first.acquire_or_extend().await.unwrap();
    first.release().await.unwrap();
    assert!(!first.is_held());

    second.acquire_or_extend().await.unwrap();
    assert!(second.is_held());
    second.release().await.unwrap();

    setup.cleanup().await;
}
