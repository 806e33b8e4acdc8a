//! Publisher - the producing side of a service.
//!
//! A `Publisher` owns one long-lived producer connection. Request handlers
//! share it through an `Arc` and call [`Publisher::publish`] or
//! [`Publisher::publish_event`]; each call wraps the payload in an
//! [`Envelope`], routes it by partition key and waits for the broker's
//! acknowledgment. Failures are returned to the caller, never retried here.
//!
//! ## Example
//!
//! ```
//! use orderflow::bus::MemoryCluster;
//! use orderflow::config::BrokerConfig;
//! use orderflow::topic::TopicConfig;
//! use orderflow::Publisher;
//! use serde_json::json;
//!
//! # tokio_test_block(async {
//! let cluster = MemoryCluster::new();
//! cluster.create_topic(TopicConfig::new("order.created", 3, 1)).unwrap();
//!
//! let publisher = Publisher::new(cluster.clone(), BrokerConfig::local("order-service"));
//! publisher.connect().await.unwrap();
//! let receipt = publisher
//!     .publish("order.created", Some("a@x.com"), &json!({ "orderId": "o1" }))
//!     .await
//!     .unwrap();
//! assert_eq!(receipt.partition_key, "a@x.com");
//! publisher.disconnect().await.unwrap();
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::bus::{Connector, Producer};
use crate::config::BrokerConfig;
use crate::envelope::{Envelope, Event};
use crate::error::BusError;
use crate::lifecycle::Service;

/// Partition key source for events without a domain key.
///
/// Yields millisecond timestamps as strings, strictly increasing even when
/// the clock stands still or goes backwards.
#[derive(Debug, Default)]
pub struct FallbackKey {
    last: AtomicI64,
}

impl FallbackKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> String {
        let now = Utc::now().timestamp_millis();
        let mut previous = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(previous + 1);
            match self.last.compare_exchange(
                previous,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return candidate.to_string(),
                Err(actual) => previous = actual,
            }
        }
    }
}

/// What the broker acknowledged for one publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReceipt {
    pub event_id: String,
    pub topic: String,
    /// Key actually used, domain or fallback
    pub partition_key: String,
    pub partition: u32,
    pub offset: i64,
}

/// Long-lived producer connection shared by request handlers.
pub struct Publisher<C: Connector> {
    connector: C,
    config: BrokerConfig,
    producer: RwLock<Option<C::Producer>>,
    closing: AtomicBool,
    fallback: FallbackKey,
}

impl<C: Connector> Publisher<C> {
    pub fn new(connector: C, config: BrokerConfig) -> Self {
        Self {
            connector,
            config,
            producer: RwLock::new(None),
            closing: AtomicBool::new(false),
            fallback: FallbackKey::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub async fn is_connected(&self) -> bool {
        !self.closing.load(Ordering::SeqCst) && self.producer.read().await.is_some()
    }

    /// Open the producer connection. Connecting twice is a no-op.
    #[instrument(skip(self), fields(client_id = %self.config.client_id))]
    pub async fn connect(&self) -> Result<(), BusError> {
        let mut slot = self.producer.write().await;
        if slot.is_none() {
            *slot = Some(self.connector.producer(&self.config).await?);
            info!(brokers = %self.config.brokers_list(), "Publisher connected");
        }
        self.closing.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Publish `payload` to `topic`.
    ///
    /// A present, non-empty `key` routes the message; otherwise a fallback
    /// key is generated. Returns once the broker acknowledged the write.
    pub async fn publish<T>(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &T,
    ) -> Result<PublishReceipt, BusError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let key = self.resolve_key(key);
        self.send(Envelope::new(topic, key, payload)).await
    }

    /// Publish a contract event on its own topic with its own key.
    pub async fn publish_event<E: Event>(&self, event: &E) -> Result<PublishReceipt, BusError> {
        let key = self.resolve_key(event.partition_key().as_deref());
        self.send(Envelope::new(E::TOPIC, key, event).with_schema_version(E::SCHEMA_VERSION))
            .await
    }

    /// Flush and release the connection.
    ///
    /// New sends are refused from the moment this is called; sends already
    /// in flight finish first. Safe to call when already disconnected.
    #[instrument(skip(self), fields(client_id = %self.config.client_id))]
    pub async fn disconnect(&self) -> Result<(), BusError> {
        self.closing.store(true, Ordering::SeqCst);
        let producer = self.producer.write().await.take();
        match producer {
            Some(producer) => {
                producer.close().await?;
                info!("Publisher disconnected");
            }
            None => debug!("Publisher already disconnected"),
        }
        Ok(())
    }

    fn resolve_key(&self, key: Option<&str>) -> String {
        match key.filter(|k| !k.is_empty()) {
            Some(key) => key.to_string(),
            None => self.fallback.next(),
        }
    }

    #[instrument(
        skip(self, envelope),
        fields(topic = %envelope.event_type, key = %envelope.partition_key, event_id = %envelope.event_id)
    )]
    async fn send<T>(&self, envelope: Envelope<&T>) -> Result<PublishReceipt, BusError>
    where
        T: Serialize + Sync + ?Sized,
    {
        if self.closing.load(Ordering::SeqCst) {
            return Err(BusError::ShuttingDown(self.config.client_id.clone()));
        }
        let bytes = envelope.to_json_bytes()?;

        let slot = self.producer.read().await;
        if self.closing.load(Ordering::SeqCst) {
            return Err(BusError::ShuttingDown(self.config.client_id.clone()));
        }
        let producer = slot
            .as_ref()
            .ok_or_else(|| BusError::NotConnected(self.config.client_id.clone()))?;

        let report = match producer
            .send(&envelope.event_type, &envelope.partition_key, &bytes)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Publish failed");
                return Err(e);
            }
        };
        debug!(partition = report.partition, offset = report.offset, "Published");

        Ok(PublishReceipt {
            event_id: envelope.event_id,
            topic: report.topic,
            partition_key: envelope.partition_key,
            partition: report.partition,
            offset: report.offset,
        })
    }
}

#[async_trait]
impl<C: Connector> Service for Publisher<C> {
    fn name(&self) -> &str {
        &self.config.client_id
    }

    async fn start(&self) -> Result<(), BusError> {
        self.connect().await
    }

    async fn stop(&self) -> Result<(), BusError> {
        self.disconnect().await
    }
}
