//! Mailer service - sends order notifications.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::config::GroupConfig;
use crate::error::HandlerError;
use crate::events::{OrderCreated, OrderItem, ORDER_CREATED};
use crate::subscriber::Dispatcher;

pub const MAILER_SERVICE: &str = "mailer-service";
pub const MAILER_GROUP: &str = "mailer-service-group";

/// What the customer is told about their order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderNotification {
    pub order_id: String,
    pub user_email: Option<String>,
    pub items: Vec<OrderItem>,
    pub timestamp: DateTime<Utc>,
}

impl From<&OrderCreated> for OrderNotification {
    fn from(order: &OrderCreated) -> Self {
        Self {
            order_id: order.order_id.clone(),
            user_email: order.user_email.clone(),
            items: order.items.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Delivery channel for notifications.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, notification: OrderNotification) -> Result<(), HandlerError>;
}

/// A notifier that logs notifications instead of mailing them.
///
/// With a buffer attached, lines are collected there instead, which lets
/// tests observe what would have been sent.
pub struct LogMailer {
    buffer: Option<Arc<Mutex<Vec<String>>>>,
}

impl Default for LogMailer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogMailer {
    pub fn new() -> Self {
        LogMailer { buffer: None }
    }

    pub fn with_buffer(buffer: Arc<Mutex<Vec<String>>>) -> Self {
        LogMailer {
            buffer: Some(buffer),
        }
    }
}

#[async_trait]
impl Notifier for LogMailer {
    async fn notify(&self, notification: OrderNotification) -> Result<(), HandlerError> {
        let body = serde_json::to_string(&notification)
            .map_err(|e| HandlerError::Other(Box::new(e)))?;
        match &self.buffer {
            Some(buffer) => buffer.lock().push(format!("[MAIL] {body}")),
            None => info!(
                order_id = %notification.order_id,
                user_email = notification.user_email.as_deref().unwrap_or(""),
                items = notification.items.len(),
                "Sending order notification"
            ),
        }
        Ok(())
    }
}

/// Group membership of the mailer.
pub fn mailer_group() -> GroupConfig {
    GroupConfig::new(MAILER_GROUP).topic(ORDER_CREATED)
}

/// Handlers of the mailer: one notification per order.
pub fn mailer_dispatcher<N: Notifier>(notifier: Arc<N>) -> Dispatcher {
    Dispatcher::new().on::<OrderCreated, _, _>(move |envelope, delivery| {
        let notifier = notifier.clone();
        async move {
            info!(
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                order_id = %envelope.payload.order_id,
                "Order received"
            );
            notifier
                .notify(OrderNotification::from(&envelope.payload))
                .await
        }
    })
}
