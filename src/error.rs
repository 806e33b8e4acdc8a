//! Error types for the publish/subscribe layer.
//!
//! [`BusError`] covers everything that can go wrong between a service and the
//! broker. [`HandlerError`] is what domain handlers return to the subscriber.

use std::error::Error;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by the broker clients, publisher, subscriber and lifecycle.
#[derive(Debug, Error)]
pub enum BusError {
    /// Topic creation failed. Non-fatal: provisioning is best-effort bootstrap.
    #[error("provisioning topic {topic} failed: {cause}")]
    Provisioning { topic: String, cause: String },

    /// Broker unreachable at connect time.
    #[error("connection to {brokers} failed: {cause}")]
    Connection { brokers: String, cause: String },

    /// The broker rejected the send or did not acknowledge it in time.
    #[error("publish to topic {topic} failed: {cause}")]
    Publish { topic: String, cause: String },

    /// The target topic does not exist on the broker.
    #[error("unknown topic {0}")]
    UnknownTopic(String),

    /// An outgoing payload could not be turned into an envelope.
    #[error("serializing {event_type} failed: {cause}")]
    Serialization { event_type: String, cause: String },

    /// A consumed message is not a valid envelope for its topic.
    #[error("deserializing message from {topic} failed: {cause}")]
    Deserialization { topic: String, cause: String },

    /// Receiving from the broker failed.
    #[error("consuming from {group} failed: {cause}")]
    Consume { group: String, cause: String },

    /// Offset commit was refused (usually after a rebalance).
    #[error("committing offset {offset} on {topic}/{partition} failed: {cause}")]
    Commit {
        topic: String,
        partition: u32,
        offset: i64,
        cause: String,
    },

    /// An operation needed an established connection.
    #[error("{0} is not connected")]
    NotConnected(String),

    /// Shutdown has begun; no new sends or receives are accepted.
    #[error("{0} is shutting down")]
    ShuttingDown(String),

    /// A subscriber state machine transition was not allowed.
    #[error("cannot {action} while {from}")]
    InvalidTransition { from: &'static str, action: &'static str },

    /// Configuration value is missing or invalid.
    #[error("configuration invalid for {var}: {reason}")]
    Config { var: String, reason: String },

    /// Services did not stop within the grace period.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}")]
    ShutdownTimeout { grace: Duration, stuck: Vec<String> },
}

impl BusError {
    /// Returns true if retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::Connection { .. }
                | BusError::Publish { .. }
                | BusError::Consume { .. }
                | BusError::Commit { .. }
        )
    }

    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            BusError::Provisioning { .. } => "provisioning",
            BusError::Connection { .. } => "connection",
            BusError::Publish { .. } => "publish",
            BusError::UnknownTopic(_) => "unknown_topic",
            BusError::Serialization { .. } => "serialization",
            BusError::Deserialization { .. } => "deserialization",
            BusError::Consume { .. } => "consume",
            BusError::Commit { .. } => "commit",
            BusError::NotConnected(_) => "not_connected",
            BusError::ShuttingDown(_) => "shutting_down",
            BusError::InvalidTransition { .. } => "invalid_transition",
            BusError::Config { .. } => "config",
            BusError::ShutdownTimeout { .. } => "shutdown_timeout",
        }
    }
}

/// Error returned by domain event handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// No handler registered for this event type.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The envelope could not be decoded into the handler's event type.
    #[error("decode failed: {0}")]
    DecodeFailed(String),

    /// Business logic refused the event.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The handler itself talked to the bus and that failed.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Anything else.
    #[error("handler error: {0}")]
    Other(Box<dyn Error + Send + Sync>),
}

impl HandlerError {
    /// Poison input: retrying cannot help.
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            HandlerError::DecodeFailed(_) | HandlerError::UnknownEventType(_)
        )
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::DecodeFailed(err.to_string())
    }
}
