use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use super::ApiError;
use crate::models::CartItem;
use crate::services::checkout_service::{self, CartSummary};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddItemRequest {
    pub product_id: String,
    #[serde(default = "default_quantity")]
    pub quantity: i32,
}

fn default_quantity() -> i32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetQuantityRequest {
    pub quantity: i32,
}

/// GET /api/cart/{user_id}
pub async fn get_cart(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<CartSummary>, ApiError> {
    let summary = checkout_service::cart_summary(state.store.as_ref(), &user_id).await?;
    Ok(Json(summary))
}

/// POST /api/cart/{user_id}/items
pub async fn add_item(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<AddItemRequest>,
) -> Result<(StatusCode, Json<CartItem>), ApiError> {
    let item = checkout_service::add_to_cart(
        state.store.as_ref(),
        &user_id,
        &body.product_id,
        body.quantity,
        state.clock.now(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(item)))
}

/// PUT /api/cart/{user_id}/items/{product_id}
///
/// Responds 204 when a zero quantity removed the line.
pub async fn set_quantity(
    State(state): State<AppState>,
    Path((user_id, product_id)): Path<(String, String)>,
    Json(body): Json<SetQuantityRequest>,
) -> Result<Response, ApiError> {
    let item =
        checkout_service::set_quantity(state.store.as_ref(), &user_id, &product_id, body.quantity)
            .await?;

    Ok(match item {
        Some(item) => Json(item).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

/// DELETE /api/cart/{user_id}/items/{product_id}
pub async fn remove_item(
    State(state): State<AppState>,
    Path((user_id, product_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    checkout_service::remove_from_cart(state.store.as_ref(), &user_id, &product_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
