//! Consumer groups: partition ownership, fan-out and independent groups.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use orderflow::bus::TopicPartition;
use orderflow::config::GroupConfig;
use orderflow::events::{OrderCreated, ORDER_CREATED};
use orderflow::services::{mailer_dispatcher, mailer_group, LogMailer, OrderRequest, OrderService};
use orderflow::{FailurePolicy, Service};

use crate::support::{
    connected_publisher, consumer_service, eventually, pipeline_cluster, recording_dispatcher,
    settled_assignment, topic_cluster, Sequenced, SEQUENCE_TOPIC,
};

fn keys(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("user-{i}@x.com")).collect()
}

#[tokio::test]
async fn members_of_a_group_split_partitions_and_messages() {
    let cluster = topic_cluster(SEQUENCE_TOPIC, 6);
    let group = GroupConfig::new("split-group").topic(SEQUENCE_TOPIC);

    let seen_a = Arc::new(Mutex::new(Vec::new()));
    let seen_b = Arc::new(Mutex::new(Vec::new()));
    let member_a = consumer_service(&cluster, "member-a", group.clone(), FailurePolicy::default(), recording_dispatcher(seen_a.clone()));
    let member_b = consumer_service(&cluster, "member-b", group, FailurePolicy::default(), recording_dispatcher(seen_b.clone()));
    member_a.start().await.unwrap();
    member_b.start().await.unwrap();

    let owned = settled_assignment(&[&member_a, &member_b], 6).await;
    let set_a: BTreeSet<&TopicPartition> = owned[0].iter().collect();
    let set_b: BTreeSet<&TopicPartition> = owned[1].iter().collect();
    assert!(set_a.is_disjoint(&set_b));
    assert_eq!(set_a.len() + set_b.len(), 6);

    let publisher = connected_publisher(&cluster, "producer").await;
    for (seq, key) in keys(12).into_iter().cycle().take(60).enumerate() {
        publisher
            .publish_event(&Sequenced { key, seq: seq as u32 })
            .await
            .unwrap();
    }

    eventually("60 deliveries across the group", || {
        seen_a.lock().len() + seen_b.lock().len() == 60
    })
    .await;
    member_a.stop().await.unwrap();
    member_b.stop().await.unwrap();

    let seqs: HashSet<u32> = seen_a
        .lock()
        .iter()
        .chain(seen_b.lock().iter())
        .map(|(event, _)| event.seq)
        .collect();
    assert_eq!(seqs.len(), 60, "a message was delivered twice");

    for (_, partition) in seen_a.lock().iter() {
        assert!(owned[0].contains(&TopicPartition::new(SEQUENCE_TOPIC, *partition)));
    }
    for (_, partition) in seen_b.lock().iter() {
        assert!(owned[1].contains(&TopicPartition::new(SEQUENCE_TOPIC, *partition)));
    }
}

#[tokio::test]
async fn independent_groups_each_see_every_message() {
    let cluster = topic_cluster(SEQUENCE_TOPIC, 3);
    let publisher = connected_publisher(&cluster, "producer").await;
    for (seq, key) in keys(5).into_iter().enumerate() {
        publisher
            .publish_event(&Sequenced { key, seq: seq as u32 })
            .await
            .unwrap();
    }

    let seen_mail = Arc::new(Mutex::new(Vec::new()));
    let seen_users = Arc::new(Mutex::new(Vec::new()));
    let mail = consumer_service(
        &cluster,
        "mail",
        GroupConfig::new("mail-group").topic(SEQUENCE_TOPIC),
        FailurePolicy::default(),
        recording_dispatcher(seen_mail.clone()),
    );
    let users = consumer_service(
        &cluster,
        "users",
        GroupConfig::new("users-group").topic(SEQUENCE_TOPIC),
        FailurePolicy::default(),
        recording_dispatcher(seen_users.clone()),
    );
    mail.start().await.unwrap();
    users.start().await.unwrap();

    eventually("both groups caught up", || {
        seen_mail.lock().len() == 5 && seen_users.lock().len() == 5
    })
    .await;
    mail.stop().await.unwrap();
    users.stop().await.unwrap();

    let committed = |group: &str| -> i64 {
        (0..3)
            .filter_map(|p| cluster.committed(group, &TopicPartition::new(SEQUENCE_TOPIC, p)))
            .sum()
    };
    assert_eq!(committed("mail-group"), 5);
    assert_eq!(committed("users-group"), 5);
}

#[tokio::test]
async fn two_mailers_own_disjoint_partitions() {
    let cluster = pipeline_cluster().await;

    let outbox_a = Arc::new(Mutex::new(Vec::new()));
    let outbox_b = Arc::new(Mutex::new(Vec::new()));
    let mailer_a = consumer_service(
        &cluster,
        "mailer-a",
        mailer_group(),
        FailurePolicy::default(),
        mailer_dispatcher(Arc::new(LogMailer::with_buffer(outbox_a.clone()))),
    );
    let mailer_b = consumer_service(
        &cluster,
        "mailer-b",
        mailer_group(),
        FailurePolicy::default(),
        mailer_dispatcher(Arc::new(LogMailer::with_buffer(outbox_b.clone()))),
    );
    mailer_a.start().await.unwrap();
    mailer_b.start().await.unwrap();

    let owned = settled_assignment(&[&mailer_a, &mailer_b], 3).await;
    assert!(owned[0].iter().all(|tp| !owned[1].contains(tp)));

    let orders = OrderService::new(connected_publisher(&cluster, "order-service").await);
    for email in ["a@x.com", "c@x.com", "d@x.com"] {
        orders
            .place_order(OrderRequest {
                items: vec![],
                price: 10.0,
                user_email: Some(email.into()),
                send_user_update: false,
            })
            .await
            .unwrap();
    }

    // a@x.com, c@x.com and d@x.com hash to partitions 1, 2 and 0.
    eventually("three notifications", || {
        outbox_a.lock().len() + outbox_b.lock().len() == 3
    })
    .await;
    assert!(!outbox_a.lock().is_empty());
    assert!(!outbox_b.lock().is_empty());

    mailer_a.stop().await.unwrap();
    mailer_b.stop().await.unwrap();
    assert!(cluster.members("mailer-service-group").is_empty());
}

#[tokio::test]
async fn a_leaving_member_hands_its_partitions_over() {
    let cluster = pipeline_cluster().await;
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let dispatcher = |seen: Arc<Mutex<Vec<String>>>| {
        orderflow::Dispatcher::new().on::<OrderCreated, _, _>(move |envelope, _| {
            let seen = seen.clone();
            async move {
                seen.lock().push(envelope.payload.order_id);
                Ok(())
            }
        })
    };
    let group = GroupConfig::new("handover-group").topic(ORDER_CREATED);
    let stays = consumer_service(&cluster, "stays", group.clone(), FailurePolicy::default(), dispatcher(seen.clone()));
    let leaves = consumer_service(&cluster, "leaves", group, FailurePolicy::default(), dispatcher(seen.clone()));
    stays.start().await.unwrap();
    leaves.start().await.unwrap();
    settled_assignment(&[&stays, &leaves], 3).await;
    let generation = cluster.generation("handover-group");

    leaves.stop().await.unwrap();
    assert!(cluster.generation("handover-group") > generation);
    assert_eq!(cluster.members("handover-group").len(), 1);

    let orders = OrderService::new(connected_publisher(&cluster, "order-service").await);
    let mut placed = Vec::new();
    for email in ["a@x.com", "c@x.com", "d@x.com"] {
        let order = orders
            .place_order(OrderRequest {
                items: vec![],
                price: 1.0,
                user_email: Some(email.into()),
                send_user_update: false,
            })
            .await
            .unwrap();
        placed.push(order.order_id);
    }

    eventually("remaining member handles every partition", || seen.lock().len() == 3).await;
    stays.stop().await.unwrap();

    let mut handled = seen.lock().clone();
    handled.sort();
    placed.sort();
    assert_eq!(handled, placed);
}
