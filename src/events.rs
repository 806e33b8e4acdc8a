//! The pipeline's event contract.
//!
//! Topic names and payload shapes shared by the order service and every
//! consumer. Changing a payload in an incompatible way means bumping its
//! `SCHEMA_VERSION`; consumers refuse versions newer than they know.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::Event;

pub const ORDER_CREATED: &str = "order.created";
pub const USER_CREATED: &str = "user.created";
pub const USER_UPDATED: &str = "user.updated";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub item_id: String,
    pub quantity: u32,
}

/// An order was accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: String,
    pub items: Vec<OrderItem>,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default)]
    pub send_user_update: bool,
}

impl Event for OrderCreated {
    const TOPIC: &'static str = ORDER_CREATED;

    fn partition_key(&self) -> Option<String> {
        self.user_email.clone().filter(|email| !email.is_empty())
    }
}

/// A user's record changed because of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdated {
    pub order_id: String,
    pub user_email: String,
    pub updated_at: DateTime<Utc>,
}

impl Event for UserUpdated {
    const TOPIC: &'static str = USER_UPDATED;

    fn partition_key(&self) -> Option<String> {
        Some(self.user_email.clone()).filter(|email| !email.is_empty())
    }
}
