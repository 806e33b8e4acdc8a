//! Per-key ordering through a running subscriber.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use orderflow::config::GroupConfig;
use orderflow::{FailurePolicy, Service};

use crate::support::{
    connected_publisher, consumer_service, eventually, recording_dispatcher, topic_cluster,
    Sequenced, SEQUENCE_TOPIC,
};

const KEYS: [&str; 4] = ["a@x.com", "b@x.com", "c@x.com", "d@x.com"];

#[tokio::test]
async fn events_with_one_key_arrive_in_publish_order() {
    let cluster = topic_cluster(SEQUENCE_TOPIC, 3);
    let publisher = connected_publisher(&cluster, "producer").await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let consumer = consumer_service(
        &cluster,
        "reader",
        GroupConfig::new("ordering-group").topic(SEQUENCE_TOPIC),
        FailurePolicy::default(),
        recording_dispatcher(seen.clone()),
    );
    consumer.start().await.unwrap();

    for seq in 0..25u32 {
        for key in KEYS {
            publisher
                .publish_event(&Sequenced { key: key.into(), seq })
                .await
                .unwrap();
        }
    }

    eventually("all 100 events", || seen.lock().len() == 100).await;
    consumer.stop().await.unwrap();

    let mut per_key: HashMap<String, Vec<u32>> = HashMap::new();
    for (event, _) in seen.lock().iter() {
        per_key.entry(event.key.clone()).or_default().push(event.seq);
    }
    for key in KEYS {
        let seqs = &per_key[key];
        assert_eq!(seqs, &(0..25).collect::<Vec<_>>(), "order broken for {key}");
    }
}

#[tokio::test]
async fn a_key_always_lands_on_one_partition() {
    let cluster = topic_cluster(SEQUENCE_TOPIC, 3);
    let publisher = connected_publisher(&cluster, "producer").await;

    let mut partitions: HashMap<&str, u32> = HashMap::new();
    for seq in 0..10u32 {
        for key in KEYS {
            let receipt = publisher
                .publish_event(&Sequenced { key: key.into(), seq })
                .await
                .unwrap();
            let first = *partitions.entry(key).or_insert(receipt.partition);
            assert_eq!(first, receipt.partition);
        }
    }

    for (key, partition) in partitions {
        let records = cluster.partition_records(SEQUENCE_TOPIC, partition);
        let offsets: Vec<i64> = records
            .iter()
            .filter(|r| r.key.as_deref() == Some(key))
            .map(|r| r.offset)
            .collect();
        assert_eq!(offsets.len(), 10);
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    }
}

#[tokio::test]
async fn ordering_survives_a_restart() {
    let cluster = topic_cluster(SEQUENCE_TOPIC, 3);
    let publisher = connected_publisher(&cluster, "producer").await;
    let group = GroupConfig::new("restart-group").topic(SEQUENCE_TOPIC);

    for seq in 0..10u32 {
        publisher
            .publish_event(&Sequenced { key: "a@x.com".into(), seq })
            .await
            .unwrap();
    }

    let first_run = Arc::new(Mutex::new(Vec::new()));
    let consumer = consumer_service(
        &cluster,
        "reader",
        group.clone(),
        FailurePolicy::default(),
        recording_dispatcher(first_run.clone()),
    );
    consumer.start().await.unwrap();
    eventually("first ten events", || first_run.lock().len() == 10).await;
    consumer.stop().await.unwrap();

    for seq in 10..20u32 {
        publisher
            .publish_event(&Sequenced { key: "a@x.com".into(), seq })
            .await
            .unwrap();
    }

    let second_run = Arc::new(Mutex::new(Vec::new()));
    let restarted = consumer_service(
        &cluster,
        "reader",
        group,
        FailurePolicy::default(),
        recording_dispatcher(second_run.clone()),
    );
    restarted.start().await.unwrap();
    eventually("next ten events", || second_run.lock().len() == 10).await;
    restarted.stop().await.unwrap();

    let seqs: Vec<u32> = second_run.lock().iter().map(|(e, _)| e.seq).collect();
    assert_eq!(seqs, (10..20).collect::<Vec<_>>());
}
