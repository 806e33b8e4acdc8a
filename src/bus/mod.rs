//! Broker abstraction.
//!
//! Services talk to the log through three narrow traits, handed out by a
//! [`Connector`]:
//!
//! ```text
//! ┌──────────────┐   admin()    ┌─────────┐  list / create topics
//! │  Connector   │────────────▶│  Admin  │
//! │              │  producer()  ├─────────┴┐ send(topic, key, payload)
//! │ MemoryCluster│────────────▶│ Producer │
//! │ KafkaConnector  consumer()  ├──────────┤ subscribe / poll / commit
//! │              │────────────▶│ Consumer │
//! └──────────────┘              └──────────┘
//! ```
//!
//! [`MemoryCluster`] is a complete in-process broker with partitions,
//! consumer groups and committed offsets. [`KafkaConnector`] (feature
//! `kafka`) talks to a real cluster. Both place keyed records with the
//! same [`partition_for`] function.

mod admin;
mod connector;
mod consumer;
#[cfg(feature = "kafka")]
mod kafka;
mod memory;
mod partitioner;
mod producer;

pub use admin::{Admin, CreateOutcome};
pub use connector::Connector;
pub use consumer::Consumer;
#[cfg(feature = "kafka")]
pub use kafka::{KafkaAdmin, KafkaConnector, KafkaConsumer, KafkaProducer};
pub use memory::{MemoryAdmin, MemoryCluster, MemoryConsumer, MemoryProducer};
pub use partitioner::{murmur2, partition_for};
pub use producer::{DeliveryReport, Producer, Record, TopicPartition};
