//! Integration tests for exchange routing and bindings

mod common;

use common::TestSetup;
use redmq::exchange::{
    ExchangeDirect, ExchangeFanout, ExchangeParams, ExchangeQueuePolicy, ExchangeTopic,
};
use redmq::message::ProducibleMessage;
use redmq::queue::{QueueDeliveryModel, QueueManager, QueueType};
use redmq::Error;

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_fanout_copies_to_every_queue() {
    let setup = TestSetup::new().await;
    let billing = setup
        .create_queue("billing", QueueType::Fifo, QueueDeliveryModel::PointToPoint)
        .await;
    let shipping = setup
        .create_queue("shipping", QueueType::Lifo, QueueDeliveryModel::PointToPoint)
        .await;
    let exchange = ExchangeParams::new(setup.namespace.clone(), "orders");

    let fanout = ExchangeFanout::new(setup.ctx.clone());
    assert!(fanout.bind_queue(&exchange, &billing).await.unwrap());
    assert!(fanout.bind_queue(&exchange, &shipping).await.unwrap());
    // binding twice is a no-op
    assert!(!fanout.bind_queue(&exchange, &billing).await.unwrap());

    let mut bound = fanout.get_queues(&exchange).await.unwrap();
    bound.sort();
    assert_eq!(bound, vec![billing.clone(), shipping.clone()]);

    let producer = setup.producer().await;
    let message = ProducibleMessage::builder()
        .fanout(exchange.clone())
        .body(&"order #1")
        .unwrap()
        .build()
        .unwrap();
    let ids = producer.produce(&message).await.unwrap();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);

    let messages = setup.messages();
    assert_eq!(messages.count_pending(&billing, None).await.unwrap(), 1);
    assert_eq!(messages.count_pending(&shipping, None).await.unwrap(), 1);

    fanout.unbind_queue(&exchange, &billing).await.unwrap();
    fanout.unbind_queue(&exchange, &shipping).await.unwrap();
    producer.shutdown().await.unwrap();
    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_direct_routing_key() {
    let setup = TestSetup::new().await;
    let errors = setup
        .create_queue("errors", QueueType::Fifo, QueueDeliveryModel::PointToPoint)
        .await;
    let warnings = setup
        .create_queue("warnings", QueueType::Fifo, QueueDeliveryModel::PointToPoint)
        .await;
    let exchange = ExchangeParams::new(setup.namespace.clone(), "logs");

    let direct = ExchangeDirect::new(setup.ctx.clone());
    direct.bind_queue(&exchange, &errors, "error").await.unwrap();
    direct.bind_queue(&exchange, &warnings, "warning").await.unwrap();

    let producer = setup.producer().await;
    let message = ProducibleMessage::builder()
        .direct(exchange.clone(), "error")
        .body(&"disk full")
        .unwrap()
        .build()
        .unwrap();
    assert_eq!(producer.produce(&message).await.unwrap().len(), 1);

    let messages = setup.messages();
    assert_eq!(messages.count_pending(&errors, None).await.unwrap(), 1);
    assert_eq!(messages.count_pending(&warnings, None).await.unwrap(), 0);

    let unrouted = ProducibleMessage::builder()
        .direct(exchange.clone(), "debug")
        .body(&"noise")
        .unwrap()
        .build()
        .unwrap();
    assert!(matches!(
        producer.produce(&unrouted).await,
        Err(Error::NoMatchedQueues(_))
    ));

    direct.unbind_queue(&exchange, &errors, "error").await.unwrap();
    direct.unbind_queue(&exchange, &warnings, "warning").await.unwrap();
    producer.shutdown().await.unwrap();
    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_topic_patterns() {
    let setup = TestSetup::new().await;
    let audit = setup
        .create_queue("audit", QueueType::Fifo, QueueDeliveryModel::PointToPoint)
        .await;
    let creations = setup
        .create_queue("creations", QueueType::Fifo, QueueDeliveryModel::PointToPoint)
        .await;
    let exchange = ExchangeParams::new(setup.namespace.clone(), "events");

    let topic = ExchangeTopic::new(setup.ctx.clone());
    topic.bind_queue(&exchange, &audit, "order.#").await.unwrap();
    topic.bind_queue(&exchange, &creations, "*.created").await.unwrap();

    let matched = topic.get_queues(&exchange, "order.created").await.unwrap();
    assert_eq!(matched.len(), 2);
    let matched = topic.get_queues(&exchange, "order.shipped.late").await.unwrap();
    assert_eq!(matched, vec![audit.clone()]);
    let matched = topic.get_queues(&exchange, "user.created").await.unwrap();
    assert_eq!(matched, vec![creations.clone()]);

    let producer = setup.producer().await;
    let message = ProducibleMessage::builder()
        .topic(exchange.clone(), "order.created")
        .body(&"order #1")
        .unwrap()
        .build()
        .unwrap();
    assert_eq!(producer.produce(&message).await.unwrap().len(), 2);

    let unmatched = ProducibleMessage::builder()
        .topic(exchange.clone(), "invoice.paid")
        .body(&"invoice #1")
        .unwrap()
        .build()
        .unwrap();
    assert!(matches!(
        producer.produce(&unmatched).await,
        Err(Error::NoMatchedQueues(_))
    ));

    let messages = setup.messages();
    assert_eq!(messages.count_pending(&audit, None).await.unwrap(), 1);
    assert_eq!(messages.count_pending(&creations, None).await.unwrap(), 1);

    topic.unbind_queue(&exchange, &audit, "order.#").await.unwrap();
    topic.unbind_queue(&exchange, &creations, "*.created").await.unwrap();
    producer.shutdown().await.unwrap();
    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_priority_policy_rejects_fifo_queue() {
    let setup = TestSetup::new().await;
    let urgent = setup
        .create_queue("urgent", QueueType::Priority, QueueDeliveryModel::PointToPoint)
        .await;
    let plain = setup
        .create_queue("plain", QueueType::Fifo, QueueDeliveryModel::PointToPoint)
        .await;
    let exchange = ExchangeParams::new(setup.namespace.clone(), "alerts");

    let fanout = ExchangeFanout::new(setup.ctx.clone());
    fanout
        .bind_queue_with_policy(&exchange, &urgent, ExchangeQueuePolicy::Priority)
        .await
        .unwrap();
    assert!(matches!(
        fanout.bind_queue(&exchange, &plain).await,
        Err(Error::ExchangeQueuePolicyMismatch(_))
    ));

    // the exchange already exists as a fanout exchange
    let direct = ExchangeDirect::new(setup.ctx.clone());
    assert!(matches!(
        direct.bind_queue(&exchange, &plain, "key").await,
        Err(Error::ExchangeTypeMismatch(_))
    ));

    fanout.unbind_queue(&exchange, &urgent).await.unwrap();
    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_bindings_block_deletion() {
    let setup = TestSetup::new().await;
    let queue = setup
        .create_queue("bound", QueueType::Fifo, QueueDeliveryModel::PointToPoint)
        .await;
    let exchange = ExchangeParams::new(setup.namespace.clone(), "broadcast");

    let fanout = ExchangeFanout::new(setup.ctx.clone());
    fanout.bind_queue(&exchange, &queue).await.unwrap();

    assert!(matches!(
        fanout.delete(&exchange).await,
        Err(Error::ExchangeHasBoundQueues(_))
    ));
    let queues = QueueManager::new(setup.ctx.clone());
    assert!(matches!(
        queues.delete(&queue).await,
        Err(Error::QueueHasBoundExchanges(_))
    ));

    fanout.unbind_queue(&exchange, &queue).await.unwrap();
    fanout.delete(&exchange).await.unwrap();
    queues.delete(&queue).await.unwrap();

    setup.cleanup().await;
}

#[tokio::test]
#[ignore = "Integration test - requires Redis server"]
async fn test_unbind_matches_names_case_insensitively() {
    let setup = TestSetup::new().await;
    let queue = setup
        .create_queue("ledger", QueueType::Fifo, QueueDeliveryModel::PointToPoint)
        .await;
    let exchange = ExchangeParams::new(setup.namespace.clone(), "payments");

    let fanout = ExchangeFanout::new(setup.ctx.clone());
    assert!(fanout.bind_queue(&exchange, &queue).await.unwrap());

    let shouted_queue = redmq::queue::QueueParams::new(setup.namespace.to_uppercase(), "LEDGER");
    let shouted_exchange = ExchangeParams::new(setup.namespace.to_uppercase(), "Payments");
    assert!(fanout.unbind_queue(&shouted_exchange, &shouted_queue).await.unwrap());
    assert!(fanout.get_queues(&exchange).await.unwrap().is_empty());

    // nothing left bound on either side
    fanout.delete(&exchange).await.unwrap();
    QueueManager::new(setup.ctx.clone()).delete(&queue).await.unwrap();

    setup.cleanup().await;
}
