//! Order HTTP API against a server bound to an ephemeral port.

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use orderflow::bus::MemoryCluster;
use orderflow::events::{ORDER_CREATED, USER_UPDATED};
use orderflow::http;
use orderflow::services::OrderService;
use orderflow::RawEnvelope;

use crate::support::{connected_publisher, pipeline_cluster};

async fn start_server(cluster: &MemoryCluster) -> (String, CancellationToken) {
    let orders = OrderService::new(connected_publisher(cluster, "order-service").await);
    let (listener, addr) = http::bind("127.0.0.1:0").await.unwrap();
    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        http::serve_on(orders, listener, shutdown).await.unwrap();
    });
    (format!("http://{addr}"), token)
}

#[tokio::test]
async fn health_reports_the_connection() {
    let cluster = pipeline_cluster().await;
    let (base, token) = start_server(&cluster).await;

    let resp = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["service"], "order-service");
    assert_eq!(body["connected"], true);

    token.cancel();
}

#[tokio::test]
async fn post_order_publishes_both_events() {
    let cluster = pipeline_cluster().await;
    let (base, token) = start_server(&cluster).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/api/v1/orders"))
        .json(&json!({
            "items": [{ "itemId": "p1", "quantity": 2 }],
            "price": 100,
            "userEmail": "a@x.com",
            "sendUserUpdate": true
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    let order_id = body["orderId"].as_str().unwrap().to_string();

    let created = RawEnvelope::from_record(&cluster.records(ORDER_CREATED)[0]).unwrap();
    let updated = RawEnvelope::from_record(&cluster.records(USER_UPDATED)[0]).unwrap();
    assert_eq!(created.payload["orderId"], order_id.as_str());
    assert_eq!(updated.payload["orderId"], order_id.as_str());
    assert_eq!(created.partition_key.as_deref(), Some("a@x.com"));

    token.cancel();
}

#[tokio::test]
async fn invalid_body_is_a_server_error() {
    let cluster = pipeline_cluster().await;
    let (base, token) = start_server(&cluster).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/api/v1/orders"))
        .json(&json!({ "items": "nope" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "error": "Order creation failed" }));
    assert!(cluster.records(ORDER_CREATED).is_empty());

    token.cancel();
}

#[tokio::test]
async fn broker_failure_is_a_server_error() {
    let cluster = pipeline_cluster().await;
    let (base, token) = start_server(&cluster).await;
    cluster.fail_next_sends(1);

    let resp = reqwest::Client::new()
        .post(format!("{base}/api/v1/orders"))
        .json(&json!({ "items": [], "price": 1, "userEmail": "a@x.com" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    assert!(cluster.records(ORDER_CREATED).is_empty());

    token.cancel();
}
