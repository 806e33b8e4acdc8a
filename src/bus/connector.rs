//! Connector - hands out broker connections for a service.

use async_trait::async_trait;

use super::admin::Admin;
use super::consumer::Consumer;
use super::producer::Producer;
use crate::config::BrokerConfig;
use crate::error::BusError;

/// Opens broker connections of the three kinds a service may need.
///
/// Every call establishes a new, exclusively owned connection. Services
/// never share connections; each Publisher and Subscriber asks its own.
///
/// ## Example
///
/// ```ignore
/// let cluster = MemoryCluster::new();
/// let config = BrokerConfig::new("order-service", ["localhost:9094"]);
///
/// let admin = cluster.admin(&config).await?;
/// let producer = cluster.producer(&config).await?;
/// let consumer = cluster.consumer(&config, "mailer-service-group").await?;
/// ```
#[async_trait]
pub trait Connector: Clone + Send + Sync + 'static {
    type Admin: Admin;
    type Producer: Producer;
    type Consumer: Consumer;

    /// Connect to the administrative interface.
    async fn admin(&self, config: &BrokerConfig) -> Result<Self::Admin, BusError>;

    /// Connect a producer.
    async fn producer(&self, config: &BrokerConfig) -> Result<Self::Producer, BusError>;

    /// Connect a consumer bound to `group_id`.
    async fn consumer(
        &self,
        config: &BrokerConfig,
        group_id: &str,
    ) -> Result<Self::Consumer, BusError>;
}
