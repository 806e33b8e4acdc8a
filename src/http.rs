//! HTTP boundary of the order service.
//!
//! Requires the `http` feature. Uses axum for routing.
//!
//! ## Routes
//!
//! - `POST /api/v1/orders` - place an order. Responds `201 {success, orderId}`
//!   or `500 {error: "Order creation failed"}`.
//! - `GET /health` - returns `{ "ok": true, "service": ..., "connected": ... }`.
//!
//! ## Example
//!
//! ```ignore
//! let orders = OrderService::new(publisher.clone());
//!
//! // Get the router to compose with other axum routes
//! let app = http::router(orders.clone());
//!
//! // Or serve until the token is cancelled
//! http::serve(orders, "0.0.0.0:3000", token).await?;
//! ```

use std::net::SocketAddr;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::Connector;
use crate::services::{OrderRequest, OrderService};

/// Build an axum `Router` for the order endpoints.
pub fn router<C: Connector>(orders: OrderService<C>) -> Router {
    Router::new()
        .route("/health", get(health_handler::<C>))
        .route("/api/v1/orders", post(create_order_handler::<C>))
        .with_state(orders)
}

/// Bind `addr`, returning the listener and the address actually bound.
pub async fn bind(addr: &str) -> Result<(TcpListener, SocketAddr), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    Ok((listener, local))
}

/// Serve on `listener` until `shutdown` is cancelled, then finish open requests.
pub async fn serve_on<C: Connector>(
    orders: OrderService<C>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let local = listener.local_addr()?;
    info!(addr = %local, "Order server listening");
    axum::serve(listener, router(orders))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!(addr = %local, "Order server stopped");
    Ok(())
}

/// Bind `addr` and serve until `shutdown` is cancelled.
pub async fn serve<C: Connector>(
    orders: OrderService<C>,
    addr: &str,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let (listener, _) = bind(addr).await?;
    serve_on(orders, listener, shutdown).await
}

/// `GET /health`
async fn health_handler<C: Connector>(State(orders): State<OrderService<C>>) -> impl IntoResponse {
    let publisher = orders.publisher();
    Json(json!({
        "ok": true,
        "service": publisher.client_id(),
        "connected": publisher.is_connected().await,
    }))
}

/// `POST /api/v1/orders`
async fn create_order_handler<C: Connector>(
    State(orders): State<OrderService<C>>,
    body: Result<Json<OrderRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "Invalid order body");
            return failure();
        }
    };

    match orders.place_order(request).await {
        Ok(placed) => (
            StatusCode::CREATED,
            Json(json!({ "success": true, "orderId": placed.order_id })),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, kind = e.as_label(), "Order creation failed");
            failure()
        }
    }
}

fn failure() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Order creation failed" })),
    )
        .into_response()
}
