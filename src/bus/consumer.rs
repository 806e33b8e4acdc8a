//! Consumer-group side of the broker client traits.

use std::time::Duration;

use async_trait::async_trait;

use super::producer::{Record, TopicPartition};
use crate::error::BusError;

/// A consumer-group member connection.
///
/// This is a pull-based interface: the subscriber polls records and commits
/// progress explicitly once a record has been handled. Records of a single
/// partition are returned in offset order.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    /// Join the group for the given topics.
    ///
    /// `from_beginning` only matters for a group without committed offsets:
    /// `true` starts at the earliest retained message, `false` at the end of
    /// the log as of joining.
    async fn subscribe(&self, topics: &[String], from_beginning: bool) -> Result<(), BusError>;

    /// Wait up to `timeout` for the next record on an assigned partition.
    async fn poll(&self, timeout: Duration) -> Result<Option<Record>, BusError>;

    /// Mark `record` as processed so the group resumes after it.
    async fn commit(&self, record: &Record) -> Result<(), BusError>;

    /// Partitions currently assigned to this member.
    fn assignment(&self) -> Vec<TopicPartition>;

    /// Leave the group so its partitions are rebalanced to the remaining members.
    async fn close(&self) -> Result<(), BusError>;
}
