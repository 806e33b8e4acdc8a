//! Undecodable messages and failing handlers under each failure policy.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use orderflow::bus::{Connector, Producer, TopicPartition};
use orderflow::config::{BrokerConfig, GroupConfig};
use orderflow::events::{OrderCreated, ORDER_CREATED};
use orderflow::services::{mailer_dispatcher, mailer_group, LogMailer, OrderRequest, OrderService};
use orderflow::{Dispatcher, FailurePolicy, HandlerError, Service, TopicConfig};

use crate::support::{connected_publisher, consumer_service, eventually, pipeline_cluster};

fn order(email: &str) -> OrderRequest {
    OrderRequest {
        items: vec![],
        price: 5.0,
        user_email: Some(email.into()),
        send_user_update: false,
    }
}

/// Partition of a@x.com on a three partition topic.
const A_PARTITION: u32 = 1;

#[tokio::test]
async fn invalid_body_is_skipped_and_the_next_order_handled() {
    let cluster = pipeline_cluster().await;
    let raw = cluster.producer(&BrokerConfig::local("raw")).await.unwrap();
    raw.send(ORDER_CREATED, "a@x.com", b"not json").await.unwrap();

    let orders = OrderService::new(connected_publisher(&cluster, "order-service").await);
    orders.place_order(order("a@x.com")).await.unwrap();

    let outbox = Arc::new(Mutex::new(Vec::new()));
    let mailer = consumer_service(
        &cluster,
        "mailer",
        mailer_group(),
        FailurePolicy::default(),
        mailer_dispatcher(Arc::new(LogMailer::with_buffer(outbox.clone()))),
    );
    mailer.start().await.unwrap();
    eventually("the valid order to be mailed", || outbox.lock().len() == 1).await;
    mailer.stop().await.unwrap();

    let stats = mailer.stats().unwrap();
    assert_eq!(stats.undecodable, 1);
    assert_eq!(stats.handled, 1);
    assert_eq!(
        cluster.committed("mailer-service-group", &TopicPartition::new(ORDER_CREATED, A_PARTITION)),
        Some(2)
    );
    assert!(outbox.lock()[0].starts_with("[MAIL] "));
}

#[tokio::test]
async fn failing_handler_is_dropped_by_default() {
    let cluster = pipeline_cluster().await;
    let orders = OrderService::new(connected_publisher(&cluster, "order-service").await);
    let first = orders.place_order(order("a@x.com")).await.unwrap();
    let second = orders.place_order(order("a@x.com")).await.unwrap();

    let poisoned = first.order_id.clone();
    let handled = Arc::new(Mutex::new(Vec::new()));
    let seen = handled.clone();
    let dispatcher = Dispatcher::new().on::<OrderCreated, _, _>(move |envelope, _| {
        let seen = seen.clone();
        let poisoned = poisoned.clone();
        async move {
            if envelope.payload.order_id == poisoned {
                return Err(HandlerError::Rejected("out of stock".into()));
            }
            seen.lock().push(envelope.payload.order_id);
            Ok(())
        }
    });

    let consumer = consumer_service(
        &cluster,
        "strict",
        GroupConfig::new("strict-group").topic(ORDER_CREATED),
        FailurePolicy::default(),
        dispatcher,
    );
    consumer.start().await.unwrap();
    eventually("the second order", || handled.lock().len() == 1).await;
    consumer.stop().await.unwrap();

    assert_eq!(handled.lock()[0], second.order_id);
    let stats = consumer.stats().unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.handled, 1);
    assert_eq!(
        cluster.committed("strict-group", &TopicPartition::new(ORDER_CREATED, A_PARTITION)),
        Some(2)
    );
}

#[tokio::test]
async fn retry_policy_retries_until_success() {
    let cluster = pipeline_cluster().await;
    let orders = OrderService::new(connected_publisher(&cluster, "order-service").await);
    orders.place_order(order("a@x.com")).await.unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let dispatcher = Dispatcher::new().on::<OrderCreated, _, _>(move |_, _| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(HandlerError::Rejected("mail server busy".into()));
            }
            Ok(())
        }
    });

    let consumer = consumer_service(
        &cluster,
        "patient",
        GroupConfig::new("patient-group").topic(ORDER_CREATED),
        FailurePolicy::retry(3),
        dispatcher,
    );
    consumer.start().await.unwrap();
    eventually("the third attempt", || attempts.load(Ordering::SeqCst) == 3).await;
    consumer.stop().await.unwrap();

    let stats = consumer.stats().unwrap();
    assert_eq!(stats.handled, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn undecodable_messages_are_not_retried() {
    let cluster = pipeline_cluster().await;
    let raw = cluster.producer(&BrokerConfig::local("raw")).await.unwrap();
    raw.send(ORDER_CREATED, "a@x.com", br#"{"eventId":"e1","orderId":42}"#)
        .await
        .unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let dispatcher = Dispatcher::new().on::<OrderCreated, _, _>(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    });

    let consumer = consumer_service(
        &cluster,
        "patient",
        GroupConfig::new("typed-group").topic(ORDER_CREATED),
        FailurePolicy::retry(5),
        dispatcher,
    );
    consumer.start().await.unwrap();
    eventually("the offset to move past the bad record", || {
        cluster.committed("typed-group", &TopicPartition::new(ORDER_CREATED, A_PARTITION)) == Some(1)
    })
    .await;
    consumer.stop().await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 0);
    assert_eq!(consumer.stats().unwrap().undecodable, 1);
}

#[tokio::test]
async fn dead_letter_policy_copies_poison_to_the_dlq() {
    let cluster = pipeline_cluster().await;
    cluster
        .create_topic(TopicConfig::new("order.created.dlq", 1, 1))
        .unwrap();
    let raw = cluster.producer(&BrokerConfig::local("raw")).await.unwrap();
    raw.send(ORDER_CREATED, "a@x.com", b"{broken").await.unwrap();

    let outbox = Arc::new(Mutex::new(Vec::new()));
    let mailer = consumer_service(
        &cluster,
        "mailer",
        mailer_group(),
        FailurePolicy::dead_letter(),
        mailer_dispatcher(Arc::new(LogMailer::with_buffer(outbox.clone()))),
    );
    mailer.start().await.unwrap();
    eventually("the dead letter", || !cluster.records("order.created.dlq").is_empty()).await;
    mailer.stop().await.unwrap();

    let dead = cluster.records("order.created.dlq");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload, b"{broken".to_vec());
    assert_eq!(dead[0].key.as_deref(), Some("a@x.com"));

    let stats = mailer.stats().unwrap();
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.undecodable, 1);
    assert!(outbox.lock().is_empty());
}

#[tokio::test]
async fn missing_dlq_topic_drops_the_message() {
    let cluster = pipeline_cluster().await;
    let raw = cluster.producer(&BrokerConfig::local("raw")).await.unwrap();
    raw.send(ORDER_CREATED, "a@x.com", b"[]").await.unwrap();

    let mailer = consumer_service(
        &cluster,
        "mailer",
        mailer_group(),
        FailurePolicy::dead_letter(),
        mailer_dispatcher(Arc::new(LogMailer::new())),
    );
    mailer.start().await.unwrap();
    eventually("the commit", || {
        cluster.committed("mailer-service-group", &TopicPartition::new(ORDER_CREATED, A_PARTITION))
            == Some(1)
    })
    .await;
    mailer.stop().await.unwrap();

    assert_eq!(mailer.stats().unwrap().dead_lettered, 0);
    assert!(cluster.topic_config("order.created.dlq").is_none());
}
