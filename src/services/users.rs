//! User service - keeps a per-user view of orders and updates.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::GroupConfig;
use crate::events::{OrderCreated, UserUpdated, ORDER_CREATED, USER_UPDATED};
use crate::subscriber::Dispatcher;

pub const USER_SERVICE: &str = "user-service";
pub const USER_GROUP: &str = "user-service-group";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub email: String,
    /// Orders seen for this user
    pub orders: BTreeSet<String>,
    /// Orders that asked for a user update
    pub updates: BTreeSet<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// In-memory user records keyed by email.
///
/// Redelivered events are absorbed: orders and updates are sets keyed by
/// order id.
#[derive(Debug, Default)]
pub struct UserDirectory {
    users: Mutex<BTreeMap<String, UserRecord>>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, email: &str) -> Option<UserRecord> {
        self.users.lock().get(email).cloned()
    }

    pub fn len(&self) -> usize {
        self.users.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.lock().is_empty()
    }

    /// Record an order. Orders without an email are ignored.
    pub fn record_order(&self, order: &OrderCreated) -> bool {
        let Some(email) = order.user_email.as_deref().filter(|e| !e.is_empty()) else {
            debug!(order_id = %order.order_id, "Order without userEmail; nothing to update");
            return false;
        };
        let mut users = self.users.lock();
        let user = users.entry(email.to_string()).or_insert_with(|| UserRecord {
            email: email.to_string(),
            ..UserRecord::default()
        });
        user.orders.insert(order.order_id.clone())
    }

    /// Apply a user update; returns false if it was already applied.
    pub fn apply_update(&self, update: &UserUpdated) -> bool {
        let mut users = self.users.lock();
        let user = users
            .entry(update.user_email.clone())
            .or_insert_with(|| UserRecord {
                email: update.user_email.clone(),
                ..UserRecord::default()
            });
        let fresh = user.updates.insert(update.order_id.clone());
        if user.last_updated.map_or(true, |at| at < update.updated_at) {
            user.last_updated = Some(update.updated_at);
        }
        fresh
    }
}

/// Group membership of the user service.
pub fn user_group() -> GroupConfig {
    GroupConfig::new(USER_GROUP)
        .topic(USER_UPDATED)
        .topic(ORDER_CREATED)
}

/// Handlers of the user service.
pub fn user_dispatcher(directory: Arc<UserDirectory>) -> Dispatcher {
    let orders = directory.clone();
    Dispatcher::new()
        .on::<UserUpdated, _, _>(move |envelope, _| {
            let directory = directory.clone();
            async move {
                let fresh = directory.apply_update(&envelope.payload);
                info!(
                    order_id = %envelope.payload.order_id,
                    user_email = %envelope.payload.user_email,
                    fresh,
                    "Updating user"
                );
                Ok(())
            }
        })
        .on::<OrderCreated, _, _>(move |envelope, _| {
            let directory = orders.clone();
            async move {
                if directory.record_order(&envelope.payload) {
                    info!(order_id = %envelope.payload.order_id, "Order attached to user");
                }
                Ok(())
            }
        })
}
