//! The pipeline's services: order intake, mailer and user records.
//!
//! Each service is plain glue around the core: the order service wraps a
//! [`Publisher`](crate::Publisher); the mailer and user services are
//! [`Dispatcher`](crate::Dispatcher)s run by a
//! [`ConsumerService`](crate::ConsumerService) in their own consumer group.

mod mailer;
mod orders;
mod users;

pub use mailer::{
    mailer_dispatcher, mailer_group, LogMailer, Notifier, OrderNotification, MAILER_GROUP,
    MAILER_SERVICE,
};
pub use orders::{new_order_id, OrderRequest, OrderService, PlacedOrder, ORDER_SERVICE};
pub use users::{user_dispatcher, user_group, UserDirectory, UserRecord, USER_GROUP, USER_SERVICE};
