//! Kafka connector built on rdkafka (librdkafka).
//!
//! Requires the `kafka` feature. Producers use the `murmur2_random`
//! partitioner so keyed messages land on the same partitions as with the
//! Java client, kafkajs' legacy partitioner and [`MemoryCluster`](super::MemoryCluster).
//! Consumers never auto-commit; the subscriber commits after handling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::RwLock;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer as _, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message as _};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info};

use super::admin::{Admin, CreateOutcome};
use super::connector::Connector;
use super::consumer::Consumer;
use super::producer::{DeliveryReport, Producer, Record, TopicPartition};
use crate::config::BrokerConfig;
use crate::error::BusError;
use crate::topic::TopicConfig;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_TIMEOUT_MS: &str = "30000";

/// Connects services to a Kafka cluster.
#[derive(Debug, Clone, Default)]
pub struct KafkaConnector {
    /// Extra librdkafka properties applied to every client
    overrides: Vec<(String, String)>,
}

impl KafkaConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an additional librdkafka property, e.g. `security.protocol`.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    fn client_config(&self, config: &BrokerConfig) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.brokers_list())
            .set("client.id", &config.client_id);
        for (key, value) in &self.overrides {
            client_config.set(key, value);
        }
        client_config
    }
}

fn connection_error(config: &BrokerConfig, e: KafkaError) -> BusError {
    BusError::Connection {
        brokers: config.brokers_list(),
        cause: e.to_string(),
    }
}

/// Run a blocking metadata request so an unreachable cluster fails at
/// connect time; librdkafka itself connects lazily.
async fn probe<F>(config: &BrokerConfig, fetch: F) -> Result<(), BusError>
where
    F: FnOnce() -> Result<(), KafkaError> + Send + 'static,
{
    tokio::task::spawn_blocking(fetch)
        .await
        .map_err(|e| BusError::Connection {
            brokers: config.brokers_list(),
            cause: e.to_string(),
        })?
        .map_err(|e| connection_error(config, e))
}

#[async_trait]
impl Connector for KafkaConnector {
    type Admin = KafkaAdmin;
    type Producer = KafkaProducer;
    type Consumer = KafkaConsumer;

    async fn admin(&self, config: &BrokerConfig) -> Result<KafkaAdmin, BusError> {
        let admin: AdminClient<DefaultClientContext> = self
            .client_config(config)
            .create()
            .map_err(|e| connection_error(config, e))?;
        let admin = KafkaAdmin {
            client: Arc::new(admin),
            brokers: config.brokers_list(),
        };
        // librdkafka connects lazily; fetch metadata so an unreachable
        // cluster fails here rather than on first use.
        admin.fetch_topics().await?;
        Ok(admin)
    }

    async fn producer(&self, config: &BrokerConfig) -> Result<KafkaProducer, BusError> {
        let ack_timeout_ms = config.ack_timeout.as_millis().to_string();
        let producer: FutureProducer = self
            .client_config(config)
            .set("partitioner", "murmur2_random")
            .set("acks", "all")
            .set("message.timeout.ms", &ack_timeout_ms)
            .create()
            .map_err(|e| connection_error(config, e))?;

        let client = producer.clone();
        probe(config, move || {
            client
                .client()
                .fetch_metadata(None, METADATA_TIMEOUT)
                .map(|_| ())
        })
        .await?;

        info!(brokers = %config.brokers_list(), client_id = %config.client_id, "Kafka producer created");
        Ok(KafkaProducer {
            producer,
            ack_timeout: config.ack_timeout,
        })
    }

    async fn consumer(&self, config: &BrokerConfig, group_id: &str) -> Result<KafkaConsumer, BusError> {
        let mut client_config = self.client_config(config);
        client_config
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", SESSION_TIMEOUT_MS);

        // The group consumer is created on subscribe; check the cluster
        // answers with a short-lived one.
        let check: BaseConsumer = client_config
            .create()
            .map_err(|e| connection_error(config, e))?;
        probe(config, move || {
            check.fetch_metadata(None, METADATA_TIMEOUT).map(|_| ())
        })
        .await?;
        debug!(brokers = %config.brokers_list(), group = %group_id, "Kafka consumer configured");

        Ok(KafkaConsumer {
            client_config,
            group_id: group_id.to_string(),
            brokers: config.brokers_list(),
            inner: RwLock::new(None),
        })
    }
}

/// Administrative connection to Kafka.
pub struct KafkaAdmin {
    client: Arc<AdminClient<DefaultClientContext>>,
    brokers: String,
}

impl KafkaAdmin {
    async fn fetch_topics(&self) -> Result<Vec<TopicConfig>, BusError> {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || {
            let metadata = client.inner().fetch_metadata(None, METADATA_TIMEOUT)?;
            let topics: Vec<TopicConfig> = metadata
                .topics()
                .iter()
                .filter(|topic| topic.error().is_none() && !topic.name().starts_with("__"))
                .map(|topic| {
                    let replication = topic
                        .partitions()
                        .first()
                        .map(|p| p.replicas().len())
                        .unwrap_or(0);
                    TopicConfig::new(
                        topic.name(),
                        topic.partitions().len() as u32,
                        replication as u16,
                    )
                })
                .collect();
            Ok::<_, KafkaError>(topics)
        })
        .await
        .map_err(|e| BusError::Connection {
            brokers: self.brokers.clone(),
            cause: e.to_string(),
        })?
        .map_err(|e| BusError::Connection {
            brokers: self.brokers.clone(),
            cause: e.to_string(),
        })
    }
}

#[async_trait]
impl Admin for KafkaAdmin {
    async fn list_topics(&self) -> Result<Vec<TopicConfig>, BusError> {
        self.fetch_topics().await
    }

    async fn create_topics(
        &self,
        topics: &[TopicConfig],
    ) -> Result<Vec<(String, CreateOutcome)>, BusError> {
        let new_topics: Vec<NewTopic<'_>> = topics
            .iter()
            .map(|t| {
                NewTopic::new(
                    &t.name,
                    t.partitions as i32,
                    TopicReplication::Fixed(i32::from(t.replication_factor)),
                )
            })
            .collect();
        let options = AdminOptions::new().operation_timeout(Some(METADATA_TIMEOUT));

        let results = self
            .client
            .create_topics(&new_topics, &options)
            .await
            .map_err(|e| BusError::Connection {
                brokers: self.brokers.clone(),
                cause: e.to_string(),
            })?;

        Ok(results
            .into_iter()
            .map(|result| match result {
                Ok(name) => (name, CreateOutcome::Created),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    (name, CreateOutcome::AlreadyExists)
                }
                Err((name, code)) => (name, CreateOutcome::Failed(code.to_string())),
            })
            .collect())
    }

    async fn close(&self) -> Result<(), BusError> {
        Ok(())
    }
}

/// Producer connection to Kafka.
pub struct KafkaProducer {
    producer: FutureProducer,
    ack_timeout: Duration,
}

#[async_trait]
impl Producer for KafkaProducer {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<DeliveryReport, BusError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);
        let (partition, offset) = self
            .producer
            .send(record, self.ack_timeout)
            .await
            .map_err(|(err, _)| match err.rdkafka_error_code() {
                Some(RDKafkaErrorCode::UnknownTopicOrPartition)
                | Some(RDKafkaErrorCode::UnknownTopic) => BusError::UnknownTopic(topic.to_string()),
                _ => BusError::Publish {
                    topic: topic.to_string(),
                    cause: err.to_string(),
                },
            })?;

        Ok(DeliveryReport {
            topic: topic.to_string(),
            partition: partition as u32,
            offset,
        })
    }

    async fn close(&self) -> Result<(), BusError> {
        let producer = self.producer.clone();
        let timeout = self.ack_timeout;
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| BusError::Publish {
                topic: "*".into(),
                cause: e.to_string(),
            })?
            .map_err(|e| BusError::Publish {
                topic: "*".into(),
                cause: format!("flush failed: {e}"),
            })
    }
}

/// Consumer-group member connected to Kafka.
///
/// The underlying client is created on subscribe, when the offset reset
/// policy is known.
pub struct KafkaConsumer {
    client_config: ClientConfig,
    group_id: String,
    brokers: String,
    inner: RwLock<Option<Arc<StreamConsumer>>>,
}

impl KafkaConsumer {
    fn current(&self) -> Result<Arc<StreamConsumer>, BusError> {
        self.inner
            .read()
            .clone()
            .ok_or_else(|| BusError::NotConnected(self.group_id.clone()))
    }

    fn consume_error(&self, e: impl ToString) -> BusError {
        BusError::Consume {
            group: self.group_id.clone(),
            cause: e.to_string(),
        }
    }
}

fn to_record(message: &BorrowedMessage<'_>) -> Record {
    let timestamp = message
        .timestamp()
        .to_millis()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);
    Record {
        topic: message.topic().to_string(),
        partition: message.partition() as u32,
        offset: message.offset(),
        key: message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned()),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        timestamp,
    }
}

#[async_trait]
impl Consumer for KafkaConsumer {
    async fn subscribe(&self, topics: &[String], from_beginning: bool) -> Result<(), BusError> {
        let mut client_config = self.client_config.clone();
        client_config.set(
            "auto.offset.reset",
            if from_beginning { "earliest" } else { "latest" },
        );
        let consumer: StreamConsumer = client_config.create().map_err(|e| BusError::Connection {
            brokers: self.brokers.clone(),
            cause: e.to_string(),
        })?;

        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&names)
            .map_err(|e| self.consume_error(e))?;
        info!(group = %self.group_id, topics = ?names, "Kafka consumer subscribed");

        *self.inner.write() = Some(Arc::new(consumer));
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<Record>, BusError> {
        let consumer = self.current()?;
        match tokio::time::timeout(timeout, consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(message)) => Ok(Some(to_record(&message))),
            Ok(Err(e)) => Err(self.consume_error(e)),
        }
    }

    async fn commit(&self, record: &Record) -> Result<(), BusError> {
        let consumer = self.current()?;
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &record.topic,
                record.partition as i32,
                Offset::Offset(record.offset + 1),
            )
            .map_err(|e| self.consume_error(e))?;
        consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| BusError::Commit {
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
                cause: e.to_string(),
            })
    }

    fn assignment(&self) -> Vec<TopicPartition> {
        let Some(consumer) = self.inner.read().clone() else {
            return Vec::new();
        };
        consumer
            .assignment()
            .map(|list| {
                list.elements()
                    .iter()
                    .map(|e| TopicPartition::new(e.topic(), e.partition() as u32))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn close(&self) -> Result<(), BusError> {
        if let Some(consumer) = self.inner.write().take() {
            consumer.unsubscribe();
            debug!(group = %self.group_id, "Kafka consumer left the group");
        }
        Ok(())
    }
}
