//! End to end: an order flows from the order service to the mailer and the
//! user service.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use orderflow::events::{OrderItem, ORDER_CREATED, USER_UPDATED};
use orderflow::services::{
    mailer_dispatcher, mailer_group, user_dispatcher, user_group, LogMailer, OrderRequest,
    OrderService, UserDirectory,
};
use orderflow::{FailurePolicy, Lifecycle, RawEnvelope};

use crate::support::{connected_publisher, consumer_service, eventually, pipeline_cluster};

#[tokio::test]
async fn order_with_user_update_reaches_every_service() {
    let cluster = pipeline_cluster().await;
    let publisher = connected_publisher(&cluster, "order-service").await;
    let outbox = Arc::new(Mutex::new(Vec::new()));
    let directory = Arc::new(UserDirectory::new());

    let mailer = consumer_service(
        &cluster,
        "mailer-service",
        mailer_group(),
        FailurePolicy::default(),
        mailer_dispatcher(Arc::new(LogMailer::with_buffer(outbox.clone()))),
    );
    let users = consumer_service(
        &cluster,
        "user-service",
        user_group(),
        FailurePolicy::default(),
        user_dispatcher(directory.clone()),
    );
    let lifecycle = Lifecycle::new(Duration::from_secs(5))
        .with_service(publisher.clone())
        .with_service(mailer)
        .with_service(users);
    lifecycle.start().await.unwrap();

    let placed = OrderService::new(publisher)
        .place_order(OrderRequest {
            items: vec![OrderItem {
                item_id: "p1".into(),
                quantity: 2,
            }],
            price: 100.0,
            user_email: Some("a@x.com".into()),
            send_user_update: true,
        })
        .await
        .unwrap();
    assert_eq!(placed.order_id.len(), 10);

    let order_id = placed.order_id.clone();
    eventually("the user record", || {
        directory.get("a@x.com").is_some_and(|user| {
            user.orders.contains(&order_id) && user.updates.contains(&order_id)
        })
    })
    .await;
    eventually("the notification", || outbox.lock().len() == 1).await;
    lifecycle.shutdown().await.unwrap();

    assert!(outbox.lock()[0].contains(&placed.order_id));

    let created = cluster.records(ORDER_CREATED);
    let updated = cluster.records(USER_UPDATED);
    assert_eq!(created.len(), 1);
    assert_eq!(updated.len(), 1);
    assert_eq!(created[0].key.as_deref(), Some("a@x.com"));
    assert_eq!(updated[0].key.as_deref(), Some("a@x.com"));
    assert_eq!(created[0].partition, updated[0].partition);

    let created = RawEnvelope::from_record(&created[0]).unwrap();
    let updated = RawEnvelope::from_record(&updated[0]).unwrap();
    assert_eq!(created.payload["orderId"], placed.order_id.as_str());
    assert_eq!(updated.payload["orderId"], placed.order_id.as_str());
    assert_ne!(created.event_id, updated.event_id);
}

#[tokio::test]
async fn anonymous_order_without_update_publishes_once() {
    let cluster = pipeline_cluster().await;
    let orders = OrderService::new(connected_publisher(&cluster, "order-service").await);

    let placed = orders
        .place_order(OrderRequest {
            items: vec![],
            price: 1.5,
            user_email: None,
            send_user_update: true,
        })
        .await
        .unwrap();

    assert!(placed.user_update.is_none());
    assert!(cluster.records(USER_UPDATED).is_empty());

    let records = cluster.records(ORDER_CREATED);
    assert_eq!(records.len(), 1);
    // Without an email the key is a generated timestamp.
    let key = records[0].key.clone().unwrap();
    assert!(key.parse::<i64>().is_ok(), "unexpected key {key}");
    assert_eq!(placed.order_event.partition_key, key);
}

#[tokio::test]
async fn rejected_publish_fails_the_order() {
    let cluster = pipeline_cluster().await;
    let orders = OrderService::new(connected_publisher(&cluster, "order-service").await);
    cluster.fail_next_sends(1);

    let err = orders
        .place_order(OrderRequest {
            items: vec![],
            price: 1.0,
            user_email: Some("a@x.com".into()),
            send_user_update: true,
        })
        .await
        .unwrap_err();
    assert_eq!(err.as_label(), "publish");
    assert!(cluster.records(ORDER_CREATED).is_empty());
    assert!(cluster.records(USER_UPDATED).is_empty());
}
