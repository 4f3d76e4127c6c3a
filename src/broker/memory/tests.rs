use super::*;
use futures::StreamExt;

async fn declared(broker: &MemoryBroker) -> MemoryChannel {
    let channel = broker.open_channel().await.unwrap();
    channel
        .declare_exchange(&ExchangeSpec::topic("events"))
        .await
        .unwrap();
    channel
        .declare_queue(&QueueSpec::durable("orders"))
        .await
        .unwrap();
    channel.bind_queue("orders", "events", "orders.*").await.unwrap();
    channel
}

#[test]
fn test_topic_matches_exact() {
    assert!(topic_matches("user_messages", "user_messages"));
    assert!(topic_matches("user:42", "user:42"));
    assert!(!topic_matches("user:42", "user:43"));
}

#[test]
fn test_topic_matches_star() {
    assert!(topic_matches("orders.*", "orders.created"));
    assert!(!topic_matches("orders.*", "orders"));
    assert!(!topic_matches("orders.*", "orders.created.late"));
}

#[test]
fn test_topic_matches_hash() {
    assert!(topic_matches("#", "anything"));
    assert!(topic_matches("#", "a.b.c"));
    assert!(topic_matches("orders.#", "orders"));
    assert!(topic_matches("orders.#", "orders.a.b"));
    assert!(!topic_matches("orders.#", "inventory.a"));
}

#[tokio::test]
async fn test_redeclare_identical_is_noop() {
    let broker = MemoryBroker::new();
    let channel = declared(&broker).await;

    channel
        .declare_exchange(&ExchangeSpec::topic("events"))
        .await
        .unwrap();
    channel
        .declare_queue(&QueueSpec::durable("orders"))
        .await
        .unwrap();
    channel.bind_queue("orders", "events", "orders.*").await.unwrap();

    assert_eq!(broker.exchange_count(), 1);
    assert_eq!(broker.queue_names(), vec!["orders".to_string()]);
    assert_eq!(broker.bindings().len(), 1);
    assert!(channel.is_open());
}

#[tokio::test]
async fn test_conflicting_exchange_fails_and_closes_channel() {
    let broker = MemoryBroker::new();
    let channel = declared(&broker).await;

    let conflicting = ExchangeSpec {
        name: "events".to_string(),
        kind: ExchangeKind::Direct,
        durable: true,
    };
    let result = channel.declare_exchange(&conflicting).await;

    assert!(matches!(result, Err(BrokerError::PreconditionFailed(_))));
    assert!(!channel.is_open());
    assert_eq!(broker.exchange("events"), Some(ExchangeSpec::topic("events")));
}

#[tokio::test]
async fn test_conflicting_queue_durability_fails() {
    let broker = MemoryBroker::new();
    let channel = declared(&broker).await;

    let transient = QueueSpec {
        name: "orders".to_string(),
        durable: false,
    };
    let result = channel.declare_queue(&transient).await;
    assert!(matches!(result, Err(BrokerError::PreconditionFailed(_))));
}

#[tokio::test]
async fn test_publish_routes_to_matching_queue() {
    let broker = MemoryBroker::new();
    let channel = declared(&broker).await;

    let routed = channel
        .publish("events", "orders.created", b"hello")
        .await
        .unwrap();

    assert_eq!(routed, Routed::Delivered);
    assert_eq!(broker.peek("orders"), vec![b"hello".to_vec()]);
}

#[tokio::test]
async fn test_publish_without_binding_is_unroutable() {
    let broker = MemoryBroker::new();
    let channel = declared(&broker).await;

    let routed = channel
        .publish("events", "inventory.created", b"lost")
        .await
        .unwrap();

    assert_eq!(routed, Routed::Unroutable);
    assert_eq!(broker.queue_depth("orders"), 0);
}

#[tokio::test]
async fn test_publish_to_missing_exchange_fails() {
    let broker = MemoryBroker::new();
    let channel = broker.open_channel().await.unwrap();

    let result = channel.publish("nope", "key", b"x").await;
    assert!(matches!(result, Err(BrokerError::NotFound(_))));
}

#[tokio::test]
async fn test_queue_bound_twice_receives_one_copy() {
    let broker = MemoryBroker::new();
    let channel = declared(&broker).await;
    channel.bind_queue("orders", "events", "#").await.unwrap();

    channel.publish("events", "orders.created", b"once").await.unwrap();

    assert_eq!(broker.queue_depth("orders"), 1);
}

#[tokio::test]
async fn test_consume_in_fifo_order_and_ack() {
    let broker = MemoryBroker::new();
    let channel = declared(&broker).await;
    for body in [b"1", b"2", b"3"] {
        channel.publish("events", "orders.x", body).await.unwrap();
    }

    let mut stream = channel.consume("orders", "test", 10).await.unwrap();
    for expected in [b"1", b"2", b"3"] {
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.body(), expected);
        assert!(!delivery.redelivered());
        delivery.ack().await.unwrap();
    }

    assert_eq!(broker.queue_depth("orders"), 0);
    assert_eq!(broker.unacked_count("orders"), 0);
    assert_eq!(broker.discarded_count(), 0);
}

#[tokio::test]
async fn test_consumer_waits_for_publish() {
    let broker = MemoryBroker::new();
    let channel = declared(&broker).await;
    let mut stream = channel.consume("orders", "test", 10).await.unwrap();

    let publisher = broker.open_channel().await.unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        publisher.publish("events", "orders.late", b"late").await.unwrap();
    });

    let delivery = tokio::time::timeout(std::time::Duration::from_secs(1), stream.next())
        .await
        .expect("consumer never woke")
        .unwrap()
        .unwrap();
    assert_eq!(delivery.routing_key(), "orders.late");
}

#[tokio::test]
async fn test_nack_requeue_redelivers_at_head() {
    let broker = MemoryBroker::new();
    let channel = declared(&broker).await;
    channel.publish("events", "orders.a", b"first").await.unwrap();
    channel.publish("events", "orders.b", b"second").await.unwrap();

    let mut stream = channel.consume("orders", "test", 10).await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    first.nack(true).await.unwrap();

    let again = stream.next().await.unwrap().unwrap();
    assert_eq!(again.body(), b"first");
    assert!(again.redelivered());
}

#[tokio::test]
async fn test_reject_without_requeue_discards() {
    let broker = MemoryBroker::new();
    let channel = declared(&broker).await;
    channel.publish("events", "orders.a", b"poison").await.unwrap();

    let mut stream = channel.consume("orders", "test", 10).await.unwrap();
    let delivery = stream.next().await.unwrap().unwrap();
    delivery.reject(false).await.unwrap();

    assert_eq!(broker.queue_depth("orders"), 0);
    assert_eq!(broker.unacked_count("orders"), 0);
    assert_eq!(broker.discarded_count(), 1);
}

#[tokio::test]
async fn test_dropped_consumer_requeues_unacked() {
    let broker = MemoryBroker::new();
    let channel = declared(&broker).await;
    channel.publish("events", "orders.a", b"a").await.unwrap();
    channel.publish("events", "orders.b", b"b").await.unwrap();

    {
        let mut stream = channel.consume("orders", "crashy", 10).await.unwrap();
        let a = stream.next().await.unwrap().unwrap();
        let b = stream.next().await.unwrap().unwrap();
        assert_eq!(broker.unacked_count("orders"), 2);
        drop((a, b));
    }

    assert_eq!(broker.unacked_count("orders"), 0);
    assert_eq!(broker.peek("orders"), vec![b"a".to_vec(), b"b".to_vec()]);

    let mut stream = channel.consume("orders", "restarted", 10).await.unwrap();
    let delivery = stream.next().await.unwrap().unwrap();
    assert_eq!(delivery.body(), b"a");
    assert!(delivery.redelivered());
}

#[tokio::test]
async fn test_settle_after_requeue_is_unknown_tag() {
    let broker = MemoryBroker::new();
    let channel = declared(&broker).await;
    channel.publish("events", "orders.a", b"a").await.unwrap();

    let mut stream = channel.consume("orders", "test", 10).await.unwrap();
    let delivery = stream.next().await.unwrap().unwrap();
    drop(stream);

    assert!(matches!(delivery.ack().await, Err(BrokerError::Channel(_))));
}

#[tokio::test]
async fn test_unavailable_broker_closes_channels() {
    let broker = MemoryBroker::new();
    let channel = declared(&broker).await;

    broker.set_available(false);

    assert!(!channel.is_open());
    assert!(matches!(
        channel.publish("events", "orders.a", b"a").await,
        Err(BrokerError::Connection(_))
    ));
    assert!(matches!(
        broker.open_channel().await,
        Err(BrokerError::Connection(_))
    ));

    broker.set_available(true);
    let fresh = broker.open_channel().await.unwrap();
    assert!(fresh.is_open());
    assert!(!channel.is_open());
}

#[tokio::test]
async fn test_connection_drop_ends_consumer_stream() {
    let broker = MemoryBroker::new();
    let channel = declared(&broker).await;
    let mut stream = channel.consume("orders", "test", 10).await.unwrap();

    let dropper = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        dropper.drop_connections();
    });

    let next = tokio::time::timeout(std::time::Duration::from_secs(1), stream.next())
        .await
        .expect("stream did not end");
    assert!(next.is_none());
}
