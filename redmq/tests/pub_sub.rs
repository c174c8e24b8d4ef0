//! Integration tests for PUB_SUB queues and consumer groups

mod common;

use common::mock_handlers::CountingHandler;
use common::{wait_for, TestSetup};
use redmq::message::ProducibleMessage;
use redmq::queue::{ConsumerGroups, QueueDeliveryModel, QueueType};
use redmq::Error;
use std::time::Duration;

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_every_group_gets_a_copy() {
    let setup = TestSetup::new().await;
    let queue = setup
        .create_queue("notifications", QueueType::Fifo, QueueDeliveryModel::PubSub)
        .await;

    let groups = ConsumerGroups::new(setup.ctx.clone());
    assert!(groups.save(&queue, "email").await.unwrap());
    assert!(groups.save(&queue, "sms").await.unwrap());
    assert!(!groups.save(&queue, "email").await.unwrap());

    let producer = setup.producer().await;
    let message = ProducibleMessage::builder()
        .queue(queue.clone())
        .body(&"welcome")
        .unwrap()
        .build()
        .unwrap();
    let ids = producer.produce(&message).await.unwrap();
    assert_eq!(ids.len(), 2);

    let messages = setup.messages();
    assert_eq!(messages.count_pending(&queue, Some("email")).await.unwrap(), 1);
    assert_eq!(messages.count_pending(&queue, Some("sms")).await.unwrap(), 1);
    assert_eq!(messages.counts(&queue).await.unwrap().pending, 2);

    let email = CountingHandler::default();
    let sms = CountingHandler::default();
    let consumer = setup.consumer();
    consumer.consume(&queue, Some("email"), email.clone()).await.unwrap();
    consumer.consume(&queue, Some("sms"), sms.clone()).await.unwrap();
    consumer.run().await.unwrap();

    let done = wait_for(
        || {
            let (email, sms) = (email.clone(), sms.clone());
            async move { email.count() == 1 && sms.count() == 1 }
        },
        Duration::from_secs(10),
    )
    .await;
    consumer.shutdown().await.unwrap();
    assert!(done);

    producer.shutdown().await.unwrap();
    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_targeted_group() {
    let setup = TestSetup::new().await;
    let queue = setup
        .create_queue("targeted", QueueType::Fifo, QueueDeliveryModel::PubSub)
        .await;
    let groups = ConsumerGroups::new(setup.ctx.clone());
    groups.save(&queue, "email").await.unwrap();
    groups.save(&queue, "sms").await.unwrap();

    let producer = setup.producer().await;
    let message = ProducibleMessage::builder()
        .queue(queue.clone())
        .consumer_group("sms")
        .body(&"code 1234")
        .unwrap()
        .build()
        .unwrap();
    assert_eq!(producer.produce(&message).await.unwrap().len(), 1);

    let messages = setup.messages();
    assert_eq!(messages.count_pending(&queue, Some("email")).await.unwrap(), 0);
    assert_eq!(messages.count_pending(&queue, Some("sms")).await.unwrap(), 1);

    // a group with pending messages cannot be removed
    assert!(matches!(
        groups.delete(&queue, "sms").await,
        Err(Error::ConsumerGroupNotEmpty(_))
    ));
    groups.delete(&queue, "email").await.unwrap();
    assert_eq!(groups.list(&queue).await.unwrap(), vec!["sms".to_string()]);

    producer.shutdown().await.unwrap();
    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_produce_without_groups() {
    let setup = TestSetup::new().await;
    let queue = setup
        .create_queue("lonely", QueueType::Fifo, QueueDeliveryModel::PubSub)
        .await;

    let producer = setup.producer().await;
    let message = ProducibleMessage::builder()
        .queue(queue.clone())
        .body(&"anyone?")
        .unwrap()
        .build()
        .unwrap();
    assert!(matches!(
        producer.produce(&message).await,
        Err(Error::ConsumerGroupNotFound(_))
    ));
    assert_eq!(setup.messages().counts(&queue).await.unwrap().total, 0);

    producer.shutdown().await.unwrap();
    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_consumer_group_rules() {
    let setup = TestSetup::new().await;
    let pub_sub = setup
        .create_queue("broadcast", QueueType::Fifo, QueueDeliveryModel::PubSub)
        .await;
    let point_to_point = setup
        .create_queue("work", QueueType::Fifo, QueueDeliveryModel::PointToPoint)
        .await;
    let consumer = setup.consumer();

    assert!(matches!(
        consumer.consume(&pub_sub, None, CountingHandler::default()).await,
        Err(Error::ConsumerGroupRequired(_))
    ));
    assert!(matches!(
        consumer
            .consume(&point_to_point, Some("workers"), CountingHandler::default())
            .await,
        Err(Error::ConsumerGroupNotSupported(_))
    ));

    // consuming with a new group creates it
    let groups = ConsumerGroups::new(setup.ctx.clone());
    assert!(!groups.exists(&pub_sub, "audit").await.unwrap());
    consumer
        .consume(&pub_sub, Some("audit"), CountingHandler::default())
        .await
        .unwrap();
    assert!(groups.exists(&pub_sub, "audit").await.unwrap());

    // the same binding twice is rejected
    assert!(matches!(
        consumer
            .consume(&pub_sub, Some("audit"), CountingHandler::default())
            .await,
        Err(Error::Validation(_))
    ));
    assert!(consumer.cancel(&pub_sub, Some("audit")).await.unwrap());
    assert!(!consumer.cancel(&pub_sub, Some("audit")).await.unwrap());

    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_cancel_matches_names_case_insensitively() {
    let setup = TestSetup::new().await;
    let queue = setup
        .create_queue("alerts", QueueType::Fifo, QueueDeliveryModel::PubSub)
        .await;
    let consumer = setup.consumer();
    consumer
        .consume(&queue, Some("Pager"), CountingHandler::default())
        .await
        .unwrap();

    let shouted = redmq::queue::QueueParams::new(setup.namespace.to_uppercase(), "ALERTS");
    assert!(consumer.cancel(&shouted, Some("PAGER")).await.unwrap());
    assert!(!consumer.cancel(&queue, Some("pager")).await.unwrap());
    assert!(matches!(
        consumer.cancel(&queue, Some("bad group!")).await,
        Err(Error::Validation(_))
    ));

    setup.cleanup().await;
}
