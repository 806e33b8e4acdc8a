//! Envelopes survive the trip through the broker intact.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use orderflow::bus::{Connector, Producer};
use orderflow::config::{BrokerConfig, GroupConfig};
use orderflow::events::{OrderCreated, OrderItem, ORDER_CREATED};
use orderflow::{Dispatcher, Envelope, FailurePolicy, RawEnvelope, Service};

use crate::support::{connected_publisher, consumer_service, eventually, pipeline_cluster};

fn capturing(seen: Arc<Mutex<Vec<Envelope<OrderCreated>>>>) -> Dispatcher {
    Dispatcher::new().on::<OrderCreated, _, _>(move |envelope, _| {
        let seen = seen.clone();
        async move {
            seen.lock().push(envelope);
            Ok(())
        }
    })
}

#[tokio::test]
async fn consumer_sees_what_the_producer_sent() {
    let cluster = pipeline_cluster().await;
    let publisher = connected_publisher(&cluster, "order-service").await;
    let order = OrderCreated {
        order_id: "V1StGXR8_Z".into(),
        items: vec![OrderItem {
            item_id: "p1".into(),
            quantity: 2,
        }],
        price: 100.0,
        user_email: Some("a@x.com".into()),
        send_user_update: true,
    };
    let receipt = publisher.publish_event(&order).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let consumer = consumer_service(
        &cluster,
        "reader",
        GroupConfig::new("envelope-group").topic(ORDER_CREATED),
        FailurePolicy::default(),
        capturing(seen.clone()),
    );
    consumer.start().await.unwrap();
    eventually("the envelope", || seen.lock().len() == 1).await;
    consumer.stop().await.unwrap();

    let envelope = seen.lock()[0].clone();
    assert_eq!(envelope.payload, order);
    assert_eq!(envelope.event_id, receipt.event_id);
    assert_eq!(envelope.event_type, ORDER_CREATED);
    assert_eq!(envelope.partition_key, "a@x.com");
    assert_eq!(envelope.schema_version, 1);
}

#[tokio::test]
async fn wire_format_is_one_flat_object() {
    let cluster = pipeline_cluster().await;
    let publisher = connected_publisher(&cluster, "order-service").await;
    publisher
        .publish(ORDER_CREATED, Some("a@x.com"), &json!({ "orderId": "o1", "items": [], "price": 1.0 }))
        .await
        .unwrap();

    let record = &cluster.records(ORDER_CREATED)[0];
    let body: serde_json::Value = serde_json::from_slice(&record.payload).unwrap();
    assert_eq!(body["eventType"], ORDER_CREATED);
    assert_eq!(body["partitionKey"], "a@x.com");
    assert_eq!(body["schemaVersion"], 1);
    assert_eq!(body["orderId"], "o1");
    assert!(body["eventId"].is_string());
    assert!(body["producedAt"].is_string());

    let raw = RawEnvelope::from_record(record).unwrap();
    assert!(!raw.payload.contains_key("eventId"));
    assert_eq!(raw.payload.len(), 3);
}

#[tokio::test]
async fn legacy_and_future_envelopes_at_the_consumer() {
    let cluster = pipeline_cluster().await;
    let raw = cluster.producer(&BrokerConfig::local("legacy")).await.unwrap();
    let legacy = json!({
        "eventId": "legacy-1",
        "orderId": "o-legacy",
        "items": [],
        "price": 2.0,
        "userEmail": "a@x.com",
        "timeStamp": "2024-05-01T10:00:00Z"
    });
    let future = json!({
        "eventId": "future-1",
        "eventType": ORDER_CREATED,
        "schemaVersion": 2,
        "producedAt": "2024-05-01T10:00:01Z",
        "orderId": "o-future",
        "items": [],
        "price": 2.0
    });
    raw.send(ORDER_CREATED, "a@x.com", legacy.to_string().as_bytes())
        .await
        .unwrap();
    raw.send(ORDER_CREATED, "a@x.com", future.to_string().as_bytes())
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let consumer = consumer_service(
        &cluster,
        "reader",
        GroupConfig::new("compat-group").topic(ORDER_CREATED),
        FailurePolicy::default(),
        capturing(seen.clone()),
    );
    consumer.start().await.unwrap();
    eventually("the legacy envelope", || seen.lock().len() == 1).await;
    eventually("both records committed", || {
        cluster.committed("compat-group", &orderflow::bus::TopicPartition::new(ORDER_CREATED, 1))
            == Some(2)
    })
    .await;
    consumer.stop().await.unwrap();

    let envelope = seen.lock()[0].clone();
    assert_eq!(envelope.event_id, "legacy-1");
    assert_eq!(envelope.partition_key, "a@x.com");
    assert_eq!(envelope.payload.order_id, "o-legacy");

    let stats = consumer.stats().unwrap();
    assert_eq!(stats.handled, 1);
    assert_eq!(stats.undecodable, 1);
}
