//! Topic provisioning against the in-memory cluster.

use orderflow::bus::MemoryCluster;
use orderflow::config::BrokerConfig;
use orderflow::events::{ORDER_CREATED, USER_CREATED, USER_UPDATED};
use orderflow::{ensure_topics, TopicRegistry, TopicSpec};

fn admin_config() -> BrokerConfig {
    BrokerConfig::local("admin")
}

#[tokio::test]
async fn provisions_pipeline_topics() {
    let cluster = MemoryCluster::new();
    let report = TopicRegistry::pipeline().ensure(&cluster, &admin_config()).await;

    assert!(report.is_complete());
    assert_eq!(report.created, vec![ORDER_CREATED, USER_CREATED, USER_UPDATED]);
    assert!(report.existing.is_empty());

    let orders = cluster.topic_config(ORDER_CREATED).unwrap();
    assert_eq!(orders.partitions, 3);
    assert_eq!(orders.replication_factor, 1);
    assert_eq!(cluster.topic_config(USER_CREATED).unwrap().partitions, 1);
}

#[tokio::test]
async fn second_run_changes_nothing() {
    let cluster = MemoryCluster::new();
    let registry = TopicRegistry::pipeline();
    registry.ensure(&cluster, &admin_config()).await;

    let again = registry.ensure(&cluster, &admin_config()).await;
    assert!(again.created.is_empty());
    assert_eq!(again.existing.len(), 3);
    assert!(again.failed.is_empty());
    assert_eq!(cluster.topic_config(ORDER_CREATED).unwrap().partitions, 3);
}

#[tokio::test]
async fn existing_configuration_is_kept() {
    let cluster = MemoryCluster::new();
    ensure_topics(&cluster, &admin_config(), &[TopicSpec::new("audit").partitions(2)]).await;

    let report = ensure_topics(&cluster, &admin_config(), &[TopicSpec::new("audit").partitions(6)]).await;
    assert_eq!(report.existing, vec!["audit"]);
    assert_eq!(cluster.topic_config("audit").unwrap().partitions, 2);
}

#[tokio::test]
async fn one_bad_topic_does_not_block_the_rest() {
    let cluster = MemoryCluster::with_brokers(1);
    let specs = [
        TopicSpec::new("replicated").replication_factor(3),
        TopicSpec::new("plain"),
    ];
    let report = ensure_topics(&cluster, &admin_config(), &specs).await;

    assert_eq!(report.created, vec!["plain"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].topic, "replicated");
    assert!(cluster.topic_config("replicated").is_none());
}

#[tokio::test]
async fn unreachable_broker_reports_every_topic() {
    let cluster = MemoryCluster::new();
    cluster.set_reachable(false);

    let report = TopicRegistry::pipeline().ensure(&cluster, &admin_config()).await;
    assert!(!report.is_complete());
    assert_eq!(report.failed.len(), 3);
    assert!(report.created.is_empty());
}
