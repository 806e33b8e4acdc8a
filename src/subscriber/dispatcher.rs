//! Dispatcher - event-type handler registry for subscribers.
//!
//! A `Dispatcher` maps event types (topic names) to typed async handlers.
//! Each handler receives the decoded [`Envelope`] and the [`Delivery`]
//! position it came from.
//!
//! ## Example
//!
//! ```
//! use orderflow::events::OrderCreated;
//! use orderflow::Dispatcher;
//!
//! let dispatcher = Dispatcher::new().on::<OrderCreated, _, _>(|envelope, delivery| async move {
//!     println!("order {} at {}", envelope.payload.order_id, delivery.offset);
//!     Ok(())
//! });
//! assert_eq!(dispatcher.event_types(), vec!["order.created"]);
//! ```

use std::collections::HashMap;
use std::future::Future;

use futures::future::{self, BoxFuture, FutureExt};
use serde::Serialize;

use crate::bus::Record;
use crate::envelope::{Envelope, Event, RawEnvelope};
use crate::error::HandlerError;

/// Where a message sat in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub topic: String,
    pub partition: u32,
    pub offset: i64,
    pub key: Option<String>,
}

impl From<&Record> for Delivery {
    fn from(record: &Record) -> Self {
        Self {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            key: record.key.clone(),
        }
    }
}

type BoxedHandler =
    Box<dyn Fn(RawEnvelope, Delivery) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Routes raw envelopes to the handler registered for their event type.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<String, BoxedHandler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for event type `E`.
    ///
    /// Uses builder pattern; a later registration for the same type replaces
    /// the earlier one.
    pub fn on<E, F, Fut>(mut self, handler: F) -> Self
    where
        E: Event,
        F: Fn(Envelope<E>, Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |raw: RawEnvelope, delivery: Delivery| {
            match raw.into_typed::<E>() {
                Ok(envelope) => handler(envelope, delivery).boxed(),
                Err(e) => future::ready(Err(e)).boxed(),
            }
        });
        self.handlers.insert(E::TOPIC.to_string(), boxed);
        self
    }

    /// Decode and handle one envelope.
    pub async fn dispatch(&self, raw: RawEnvelope, delivery: Delivery) -> Result<(), HandlerError> {
        let handler = self
            .handlers
            .get(&raw.event_type)
            .ok_or_else(|| HandlerError::UnknownEventType(raw.event_type.clone()))?;
        handler(raw, delivery).await
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
