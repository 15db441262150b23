//! Order API routes
//!
//! Placement is a single store call; points, confirmation email and status
//! notifications are handled later by the outbox dispatcher and never fail
//! the request.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiError, ListQuery};
use crate::models::{DeliveryAddress, Order, PaymentMethod};
use crate::services::checkout_service::{self, CheckoutError, PlaceOrder};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub user_id: String,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub delivery_address: Option<DeliveryAddress>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// POST /api/orders
pub async fn place_order(
    State(state): State<AppState>,
    Json(body): Json<PlaceOrderRequest>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let payment_method = body.payment_method;
    let request = PlaceOrder {
        user_id: body.user_id,
        payment_method,
        delivery_address: body.delivery_address,
        notes: body.notes,
    };

    let result =
        checkout_service::place_order(state.store.as_ref(), &state.policy, request, state.clock.now())
            .await;

    let label = match &result {
        Ok(_) => "placed",
        Err(CheckoutError::InsufficientBalance { .. }) => "insufficient_balance",
        Err(CheckoutError::Store(_)) => "error",
        Err(_) => "rejected",
    };
    state
        .metrics
        .orders_total
        .with_label_values(&[payment_method.as_str(), label])
        .inc();

    Ok((StatusCode::CREATED, Json(result?)))
}

/// GET /api/orders/{order_id}
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, ApiError> {
    let order = checkout_service::find_order(state.store.as_ref(), order_id).await?;
    Ok(Json(order))
}

/// GET /api/users/{user_id}/orders
pub async fn list_orders(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Order>>, ApiError> {
    let orders = checkout_service::list_orders(state.store.as_ref(), &user_id, query.limit()).await?;
    Ok(Json(orders))
}
