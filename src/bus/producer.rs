//! Producer side of the broker client traits.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// A partition of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// A message as delivered by the broker to a consumer.
#[derive(Debug, Clone)]
pub struct Record {
    /// Topic the message was read from
    pub topic: String,
    /// Partition within the topic
    pub partition: u32,
    /// Partition-local position
    pub offset: i64,
    /// Partition key the producer used
    pub key: Option<String>,
    /// Raw message body
    pub payload: Vec<u8>,
    /// Broker append time
    pub timestamp: DateTime<Utc>,
}

impl Record {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Get the payload as a string (if valid UTF-8).
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Broker acknowledgment of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub topic: String,
    pub partition: u32,
    pub offset: i64,
}

/// Sends keyed messages to topics.
///
/// Implementations:
/// - `MemoryProducer` - in-process cluster for tests and standalone mode
/// - `KafkaProducer` - Apache Kafka via librdkafka (feature `kafka`)
#[async_trait]
pub trait Producer: Send + Sync + 'static {
    /// Send one message and wait until the broker has accepted it.
    ///
    /// Returns an error if the broker rejects the message or the
    /// acknowledgment does not arrive. Never retries.
    async fn send(&self, topic: &str, key: &str, payload: &[u8])
        -> Result<DeliveryReport, BusError>;

    /// Wait for outstanding sends and release the connection.
    async fn close(&self) -> Result<(), BusError>;
}
