//! In-memory cluster for testing and single-process deployments.
//!
//! [`MemoryCluster`] is a partitioned append-only log with consumer-group
//! coordination. It implements [`Connector`] so publishers and subscribers
//! run against it exactly as they would against a real broker:
//! - Topics have a fixed partition count and a replication factor that must
//!   not exceed the configured broker count
//! - Keys are placed on partitions with Kafka's murmur2 partitioner
//! - Members of a group split partitions with a range assignment; every
//!   join or leave bumps the group generation and reassigns
//! - Committed offsets are kept per group and partition
//!
//! Nothing is persisted. Clone the cluster to hand it to several services;
//! clones share the same state.
//!
//! ## Example
//!
//! ```
//! use orderflow::bus::{Connector, MemoryCluster, Producer};
//! use orderflow::config::BrokerConfig;
//! use orderflow::topic::TopicConfig;
//!
//! # tokio_test_block(async {
//! let cluster = MemoryCluster::new();
//! cluster.create_topic(TopicConfig::new("order.created", 3, 1)).unwrap();
//!
//! let producer = cluster.producer(&BrokerConfig::local("docs")).await.unwrap();
//! let report = producer.send("order.created", "a@x.com", b"{}").await.unwrap();
//! assert_eq!(report.offset, 0);
//! assert_eq!(cluster.records("order.created").len(), 1);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::admin::{Admin, CreateOutcome};
use super::connector::Connector;
use super::consumer::Consumer;
use super::partitioner::partition_for;
use super::producer::{DeliveryReport, Producer, Record, TopicPartition};
use crate::config::BrokerConfig;
use crate::error::BusError;
use crate::topic::TopicConfig;

/// In-process broker with consumer-group semantics.
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<ClusterState>,
    /// Woken on every append, join and leave
    changed: Notify,
    brokers: u16,
}

#[derive(Default)]
struct ClusterState {
    topics: BTreeMap<String, TopicLog>,
    groups: HashMap<String, GroupState>,
    unreachable: bool,
    failing_sends: usize,
    auto_create: Option<u32>,
}

struct TopicLog {
    config: TopicConfig,
    partitions: Vec<Vec<Stored>>,
}

struct Stored {
    key: Option<String>,
    payload: Vec<u8>,
    timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct GroupState {
    generation: u64,
    /// member id -> subscribed topics
    members: BTreeMap<String, BTreeSet<String>>,
    assignment: HashMap<String, Vec<TopicPartition>>,
    /// member id -> generation since which it has owned each partition
    assigned_at: HashMap<String, HashMap<TopicPartition, u64>>,
    /// Next offset to consume
    committed: HashMap<TopicPartition, i64>,
}

impl GroupState {
    /// Range assignment per topic over the members subscribed to it.
    fn rebalance(&mut self, topics: &BTreeMap<String, TopicLog>) {
        self.generation += 1;
        let previous = std::mem::take(&mut self.assignment);
        self.assignment = self
            .members
            .keys()
            .map(|member| (member.clone(), Vec::new()))
            .collect();

        let wanted: BTreeSet<&String> = self.members.values().flatten().collect();
        for topic in wanted {
            let Some(log) = topics.get(topic) else {
                continue;
            };
            let interested: Vec<&String> = self
                .members
                .iter()
                .filter(|(_, subscribed)| subscribed.contains(topic))
                .map(|(member, _)| member)
                .collect();

            let partitions = log.partitions.len();
            let per_member = partitions / interested.len();
            let extra = partitions % interested.len();
            for (i, member) in interested.iter().enumerate() {
                let start = i * per_member + i.min(extra);
                let count = per_member + usize::from(i < extra);
                if let Some(owned) = self.assignment.get_mut(*member) {
                    owned.extend(
                        (start..start + count).map(|p| TopicPartition::new(topic.clone(), p as u32)),
                    );
                }
            }
        }

        let generation = self.generation;
        let assigned_at = self
            .assignment
            .iter()
            .map(|(member, owned)| {
                let kept = previous.get(member);
                let since = self.assigned_at.get(member);
                let owned_since = owned
                    .iter()
                    .map(|tp| {
                        let at = match (kept, since) {
                            (Some(kept), Some(since)) if kept.contains(tp) => {
                                since.get(tp).copied().unwrap_or(generation)
                            }
                            _ => generation,
                        };
                        (tp.clone(), at)
                    })
                    .collect();
                (member.clone(), owned_since)
            })
            .collect();
        self.assigned_at = assigned_at;
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    /// A single-broker cluster.
    pub fn new() -> Self {
        Self::with_brokers(1)
    }

    /// A cluster reporting `brokers` brokers, which bounds the replication factor.
    pub fn with_brokers(brokers: u16) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ClusterState::default()),
                changed: Notify::new(),
                brokers,
            }),
        }
    }

    /// Create unknown topics on first send with this many partitions.
    pub fn with_auto_create(self, partitions: u32) -> Self {
        self.inner.state.lock().auto_create = Some(partitions.max(1));
        self
    }

    /// Create a topic directly, bypassing an admin connection.
    pub fn create_topic(&self, config: TopicConfig) -> Result<CreateOutcome, BusError> {
        let mut state = self.inner.state.lock();
        let outcome = state.create_topic(&config, self.inner.brokers);
        match outcome {
            CreateOutcome::Failed(cause) => Err(BusError::Provisioning {
                topic: config.name,
                cause,
            }),
            other => Ok(other),
        }
    }

    /// Simulate the broker going away (`false`) or coming back (`true`).
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.state.lock().unreachable = !reachable;
        self.inner.changed.notify_waiters();
    }

    /// Reject the next `count` sends.
    pub fn fail_next_sends(&self, count: usize) {
        self.inner.state.lock().failing_sends = count;
    }

    /// Configuration of a topic, if it exists.
    pub fn topic_config(&self, topic: &str) -> Option<TopicConfig> {
        self.inner
            .state
            .lock()
            .topics
            .get(topic)
            .map(|log| log.config.clone())
    }

    /// All records of a topic, partition by partition in offset order.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        let state = self.inner.state.lock();
        let Some(log) = state.topics.get(topic) else {
            return Vec::new();
        };
        (0..log.partitions.len() as u32)
            .flat_map(|p| log.read(topic, p, 0))
            .collect()
    }

    /// Records of a single partition in offset order.
    pub fn partition_records(&self, topic: &str, partition: u32) -> Vec<Record> {
        let state = self.inner.state.lock();
        state
            .topics
            .get(topic)
            .map(|log| log.read(topic, partition, 0))
            .unwrap_or_default()
    }

    /// Next offset the group will consume from a partition, if committed.
    pub fn committed(&self, group_id: &str, tp: &TopicPartition) -> Option<i64> {
        let state = self.inner.state.lock();
        state
            .groups
            .get(group_id)
            .and_then(|group| group.committed.get(tp).copied())
    }

    /// Member ids of a group in assignment order.
    pub fn members(&self, group_id: &str) -> Vec<String> {
        let state = self.inner.state.lock();
        state
            .groups
            .get(group_id)
            .map(|group| group.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Current generation of a group (0 if it never had members).
    pub fn generation(&self, group_id: &str) -> u64 {
        let state = self.inner.state.lock();
        state
            .groups
            .get(group_id)
            .map(|group| group.generation)
            .unwrap_or_default()
    }

    fn check_reachable(&self, config: &BrokerConfig) -> Result<(), BusError> {
        if self.inner.state.lock().unreachable {
            return Err(BusError::Connection {
                brokers: config.brokers_list(),
                cause: "broker unreachable".into(),
            });
        }
        Ok(())
    }
}

impl ClusterState {
    fn create_topic(&mut self, config: &TopicConfig, brokers: u16) -> CreateOutcome {
        if self.topics.contains_key(&config.name) {
            return CreateOutcome::AlreadyExists;
        }
        if let Err(cause) = config.validate(brokers) {
            return CreateOutcome::Failed(cause);
        }

        self.topics.insert(
            config.name.clone(),
            TopicLog {
                config: config.clone(),
                partitions: (0..config.partitions).map(|_| Vec::new()).collect(),
            },
        );

        let topics = &self.topics;
        for group in self.groups.values_mut() {
            if group.members.values().any(|t| t.contains(&config.name)) {
                group.rebalance(topics);
            }
        }
        CreateOutcome::Created
    }
}

impl TopicLog {
    fn read(&self, topic: &str, partition: u32, from: i64) -> Vec<Record> {
        let Some(log) = self.partitions.get(partition as usize) else {
            return Vec::new();
        };
        log.iter()
            .enumerate()
            .skip(from.max(0) as usize)
            .map(|(offset, stored)| stored.to_record(topic, partition, offset as i64))
            .collect()
    }
}

impl Stored {
    fn to_record(&self, topic: &str, partition: u32, offset: i64) -> Record {
        Record {
            topic: topic.to_string(),
            partition,
            offset,
            key: self.key.clone(),
            payload: self.payload.clone(),
            timestamp: self.timestamp,
        }
    }
}

#[async_trait]
impl Connector for MemoryCluster {
    type Admin = MemoryAdmin;
    type Producer = MemoryProducer;
    type Consumer = MemoryConsumer;

    async fn admin(&self, config: &BrokerConfig) -> Result<MemoryAdmin, BusError> {
        self.check_reachable(config)?;
        Ok(MemoryAdmin {
            cluster: self.clone(),
        })
    }

    async fn producer(&self, config: &BrokerConfig) -> Result<MemoryProducer, BusError> {
        self.check_reachable(config)?;
        Ok(MemoryProducer {
            cluster: self.clone(),
            closed: AtomicBool::new(false),
        })
    }

    async fn consumer(
        &self,
        config: &BrokerConfig,
        group_id: &str,
    ) -> Result<MemoryConsumer, BusError> {
        self.check_reachable(config)?;
        Ok(MemoryConsumer {
            cluster: self.clone(),
            group_id: group_id.to_string(),
            member_id: format!("{}-{}", config.client_id, Uuid::new_v4()),
            local: Mutex::new(MemberLocal::default()),
        })
    }
}

/// Administrative connection to a [`MemoryCluster`].
pub struct MemoryAdmin {
    cluster: MemoryCluster,
}

#[async_trait]
impl Admin for MemoryAdmin {
    async fn list_topics(&self) -> Result<Vec<TopicConfig>, BusError> {
        let state = self.cluster.inner.state.lock();
        if state.unreachable {
            return Err(BusError::Connection {
                brokers: "memory".into(),
                cause: "broker unreachable".into(),
            });
        }
        Ok(state.topics.values().map(|log| log.config.clone()).collect())
    }

    async fn create_topics(
        &self,
        topics: &[TopicConfig],
    ) -> Result<Vec<(String, CreateOutcome)>, BusError> {
        let brokers = self.cluster.inner.brokers;
        let outcomes = {
            let mut state = self.cluster.inner.state.lock();
            if state.unreachable {
                return Err(BusError::Connection {
                    brokers: "memory".into(),
                    cause: "broker unreachable".into(),
                });
            }
            topics
                .iter()
                .map(|config| (config.name.clone(), state.create_topic(config, brokers)))
                .collect()
        };
        self.cluster.inner.changed.notify_waiters();
        Ok(outcomes)
    }

    async fn close(&self) -> Result<(), BusError> {
        Ok(())
    }
}

/// Producer connection to a [`MemoryCluster`].
pub struct MemoryProducer {
    cluster: MemoryCluster,
    closed: AtomicBool,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<DeliveryReport, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::NotConnected("memory producer".into()));
        }

        let report = {
            let mut state = self.cluster.inner.state.lock();
            if state.unreachable {
                return Err(BusError::Publish {
                    topic: topic.to_string(),
                    cause: "broker unreachable".into(),
                });
            }
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                return Err(BusError::Publish {
                    topic: topic.to_string(),
                    cause: "broker rejected the message".into(),
                });
            }
            if !state.topics.contains_key(topic) {
                match state.auto_create {
                    Some(partitions) => {
                        let config = TopicConfig::new(topic, partitions, 1);
                        state.create_topic(&config, self.cluster.inner.brokers);
                    }
                    None => return Err(BusError::UnknownTopic(topic.to_string())),
                }
            }
            let log = state
                .topics
                .get_mut(topic)
                .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;

            let partition = partition_for(key, log.partitions.len() as u32);
            let entries = &mut log.partitions[partition as usize];
            entries.push(Stored {
                key: Some(key.to_string()),
                payload: payload.to_vec(),
                timestamp: Utc::now(),
            });

            DeliveryReport {
                topic: topic.to_string(),
                partition,
                offset: entries.len() as i64 - 1,
            }
        };

        self.cluster.inner.changed.notify_waiters();
        Ok(report)
    }

    async fn close(&self) -> Result<(), BusError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct MemberLocal {
    joined: bool,
    closed: bool,
    generation: u64,
    /// Fetch position per owned partition
    positions: HashMap<TopicPartition, i64>,
    /// Round-robin start over owned partitions
    cursor: usize,
}

/// Consumer-group member connected to a [`MemoryCluster`].
pub struct MemoryConsumer {
    cluster: MemoryCluster,
    group_id: String,
    member_id: String,
    local: Mutex<MemberLocal>,
}

impl MemoryConsumer {
    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    fn consume_error(&self, cause: impl Into<String>) -> BusError {
        BusError::Consume {
            group: self.group_id.clone(),
            cause: cause.into(),
        }
    }

    fn try_fetch(&self) -> Result<Option<Record>, BusError> {
        let state = self.cluster.inner.state.lock();
        let mut local = self.local.lock();

        if local.closed {
            return Err(BusError::NotConnected(self.member_id.clone()));
        }
        if !local.joined {
            return Err(self.consume_error("poll before subscribe"));
        }
        if state.unreachable {
            return Err(self.consume_error("broker unreachable"));
        }

        let Some(group) = state.groups.get(&self.group_id) else {
            return Ok(None);
        };
        let owned = group
            .assignment
            .get(&self.member_id)
            .cloned()
            .unwrap_or_default();

        if group.generation != local.generation {
            // Keep positions only for partitions owned without a break since
            // the last generation this member saw. Anything assigned later,
            // including a partition lost and regained in between, restarts
            // from the group's commit.
            let last_seen = local.generation;
            let since = group.assigned_at.get(&self.member_id);
            local.positions.retain(|tp, _| {
                since
                    .and_then(|owned_since| owned_since.get(tp))
                    .is_some_and(|at| *at <= last_seen)
            });
            for tp in &owned {
                if !local.positions.contains_key(tp) {
                    let start = group.committed.get(tp).copied().unwrap_or(0);
                    local.positions.insert(tp.clone(), start);
                }
            }
            local.generation = group.generation;
            local.cursor = 0;
        }

        if owned.is_empty() {
            return Ok(None);
        }

        for step in 0..owned.len() {
            let idx = (local.cursor + step) % owned.len();
            let tp = &owned[idx];
            let Some(log) = state.topics.get(&tp.topic) else {
                continue;
            };
            let position = local.positions.get(tp).copied().unwrap_or(0);
            let Some(stored) = log
                .partitions
                .get(tp.partition as usize)
                .and_then(|entries| entries.get(position as usize))
            else {
                continue;
            };

            let record = stored.to_record(&tp.topic, tp.partition, position);
            local.positions.insert(tp.clone(), position + 1);
            local.cursor = idx + 1;
            return Ok(Some(record));
        }

        Ok(None)
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn subscribe(&self, topics: &[String], from_beginning: bool) -> Result<(), BusError> {
        {
            let mut guard = self.cluster.inner.state.lock();
            let state = &mut *guard;
            if state.unreachable {
                return Err(self.consume_error("broker unreachable"));
            }

            let group = state.groups.entry(self.group_id.clone()).or_default();
            if !from_beginning {
                for topic in topics {
                    if let Some(log) = state.topics.get(topic) {
                        for (p, entries) in log.partitions.iter().enumerate() {
                            group
                                .committed
                                .entry(TopicPartition::new(topic.clone(), p as u32))
                                .or_insert(entries.len() as i64);
                        }
                    }
                }
            }
            group
                .members
                .insert(self.member_id.clone(), topics.iter().cloned().collect());
            group.rebalance(&state.topics);

            self.local.lock().joined = true;
        }
        self.cluster.inner.changed.notify_waiters();
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<Record>, BusError> {
        let deadline = Instant::now() + timeout;
        loop {
            let changed = self.cluster.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if let Some(record) = self.try_fetch()? {
                return Ok(Some(record));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, changed).await;
        }
    }

    async fn commit(&self, record: &Record) -> Result<(), BusError> {
        let tp = record.topic_partition();
        let mut state = self.cluster.inner.state.lock();
        let commit_error = |cause: &str| BusError::Commit {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            cause: cause.to_string(),
        };

        if state.unreachable {
            return Err(commit_error("broker unreachable"));
        }
        let group = state
            .groups
            .get_mut(&self.group_id)
            .ok_or_else(|| commit_error("unknown group"))?;
        let owns = group
            .assignment
            .get(&self.member_id)
            .is_some_and(|owned| owned.contains(&tp));
        if !owns {
            return Err(commit_error("partition is not assigned to this member"));
        }

        let next = record.offset + 1;
        let entry = group.committed.entry(tp).or_insert(next);
        *entry = (*entry).max(next);
        Ok(())
    }

    fn assignment(&self) -> Vec<TopicPartition> {
        let state = self.cluster.inner.state.lock();
        state
            .groups
            .get(&self.group_id)
            .and_then(|group| group.assignment.get(&self.member_id).cloned())
            .unwrap_or_default()
    }

    async fn close(&self) -> Result<(), BusError> {
        {
            let mut guard = self.cluster.inner.state.lock();
            let state = &mut *guard;
            if let Some(group) = state.groups.get_mut(&self.group_id) {
                if group.members.remove(&self.member_id).is_some() {
                    group.rebalance(&state.topics);
                }
            }
            let mut local = self.local.lock();
            local.closed = true;
            local.positions.clear();
        }
        self.cluster.inner.changed.notify_waiters();
        Ok(())
    }
}
