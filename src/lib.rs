//! Publish/subscribe coordination for an event-driven order pipeline.
//!
//! An order service publishes `order.created` and `user.updated` events onto a
//! partitioned log; mailer and user services consume them in their own
//! consumer groups. This crate provides the pieces in between:
//!
//! - [`topic`] - idempotent topic provisioning
//! - [`Publisher`] - keyed, acknowledged publishing of [`Envelope`]s
//! - [`Subscriber`] / [`ConsumerService`] - consumer-group workers with
//!   per-partition ordering and at-least-once delivery
//! - [`Lifecycle`] - ordered start, signal handling and bounded shutdown
//! - [`bus`] - the broker traits, an in-memory cluster and a Kafka backend
//!   (feature `kafka`)

pub mod bus;
pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
#[cfg(feature = "http")]
pub mod http;
pub mod lifecycle;
pub mod publisher;
pub mod services;
pub mod subscriber;
pub mod telemetry;
pub mod topic;

pub use config::{BrokerConfig, GroupConfig, ServiceSettings};
pub use envelope::{Envelope, Event, RawEnvelope};
pub use error::{BusError, HandlerError};
pub use lifecycle::{Lifecycle, Service};
pub use publisher::{PublishReceipt, Publisher};
pub use subscriber::{
    ConsumerService, Delivery, Dispatcher, FailurePolicy, RunStats, Subscriber, SubscriberState,
};
pub use topic::{ensure_topics, ProvisioningReport, TopicConfig, TopicRegistry, TopicSpec};
