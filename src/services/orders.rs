//! Order service - accepts orders and announces them.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::bus::Connector;
use crate::error::BusError;
use crate::events::{OrderCreated, OrderItem, UserUpdated};
use crate::publisher::{PublishReceipt, Publisher};

pub const ORDER_SERVICE: &str = "order-service";

const ORDER_ID_LEN: usize = 10;
const ORDER_ID_ALPHABET: &[u8; 64] =
    b"useandom-26T198340PX75pxJACKVERYMINDBUSHWOLF_GQZbfghjklqvwyzrict";

/// Body of `POST /api/v1/orders`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    #[serde(default)]
    pub items: Vec<OrderItem>,
    pub price: f64,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub send_user_update: bool,
}

/// Result of a successful order placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedOrder {
    pub order_id: String,
    pub order_event: PublishReceipt,
    pub user_update: Option<PublishReceipt>,
}

/// Ten character URL-safe id.
pub fn new_order_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ORDER_ID_LEN)
        .map(|_| char::from(ORDER_ID_ALPHABET[rng.gen_range(0..ORDER_ID_ALPHABET.len())]))
        .collect()
}

/// Publishes `order.created` and, on request, `user.updated` for the same order.
pub struct OrderService<C: Connector> {
    publisher: Arc<Publisher<C>>,
}

impl<C: Connector> Clone for OrderService<C> {
    fn clone(&self) -> Self {
        Self {
            publisher: self.publisher.clone(),
        }
    }
}

impl<C: Connector> OrderService<C> {
    pub fn new(publisher: Arc<Publisher<C>>) -> Self {
        Self { publisher }
    }

    pub fn publisher(&self) -> &Arc<Publisher<C>> {
        &self.publisher
    }

    /// Announce a new order.
    ///
    /// Both events are keyed by the user's email so they land on the same
    /// partition index and stay ordered relative to that user's other events.
    #[instrument(skip(self, request), fields(user_email = request.user_email.as_deref().unwrap_or("")))]
    pub async fn place_order(&self, request: OrderRequest) -> Result<PlacedOrder, BusError> {
        let order_id = new_order_id();
        let user_email = request.user_email.clone().filter(|e| !e.is_empty());

        let order = OrderCreated {
            order_id: order_id.clone(),
            items: request.items,
            price: request.price,
            user_email: user_email.clone(),
            send_user_update: request.send_user_update,
        };
        info!(order_id = %order_id, "Sending order.created event");
        let order_event = self.publisher.publish_event(&order).await?;

        let user_update = match (request.send_user_update, user_email) {
            (true, Some(user_email)) => {
                info!(order_id = %order_id, "Sending user.updated event");
                let update = UserUpdated {
                    order_id: order_id.clone(),
                    user_email,
                    updated_at: Utc::now(),
                };
                Some(self.publisher.publish_event(&update).await?)
            }
            (true, None) => {
                warn!(order_id = %order_id, "User update requested without userEmail; skipped");
                None
            }
            (false, _) => None,
        };

        Ok(PlacedOrder {
            order_id,
            order_event,
            user_update,
        })
    }
}
