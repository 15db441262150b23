//! Admin and catalog routes
//!
//! Order status changes, product import and broadcast notifications.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::ApiError;
use crate::models::{Notification, Order, OrderStatus, Product};
use crate::normalize::normalize_product;
use crate::services::checkout_service;
use crate::services::notification_service::{self, CreateNotification};
use crate::state::AppState;
use crate::store::CatalogStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvanceOrderRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportReport {
    pub imported: usize,
    pub rejected: Vec<RejectedRecord>,
}

/// POST /api/admin/orders/{order_id}/status
pub async fn advance_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(body): Json<AdvanceOrderRequest>,
) -> Result<Json<Order>, ApiError> {
    let order =
        checkout_service::advance_order(state.store.as_ref(), order_id, body.status, state.clock.now())
            .await?;
    Ok(Json(order))
}

/// POST /api/admin/products/import
///
/// Accepts a bare array or `{"products": [...]}`. Records that fail
/// normalization are reported by index; the rest are upserted.
pub async fn import_products(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<ImportReport>, ApiError> {
    let records = match &body {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("products") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => return Err(ApiError::validation("Expected an array of products")),
        },
        _ => return Err(ApiError::validation("Expected an array of products")),
    };

    let mut report = ImportReport {
        imported: 0,
        rejected: Vec::new(),
    };

    for (index, record) in records.iter().enumerate() {
        match normalize_product(record) {
            Ok(product) => {
                state.store.upsert_product(&product).await?;
                report.imported += 1;
            }
            Err(e) => {
                tracing::warn!(index, error = %e, "Skipping product record");
                report.rejected.push(RejectedRecord {
                    index,
                    error: e.to_string(),
                });
            }
        }
    }

    tracing::info!(
        imported = report.imported,
        rejected = report.rejected.len(),
        "Product import finished"
    );
    Ok(Json(report))
}

/// GET /api/products/{product_id}
pub async fn get_product(
    State(state): State<AppState>,
    Path(product_id): Path<String>,
) -> Result<Json<Product>, ApiError> {
    state
        .store
        .find_product(&product_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Product not found: {}", product_id)))
}

/// POST /api/admin/notifications
pub async fn create_notification(
    State(state): State<AppState>,
    Json(body): Json<CreateNotification>,
) -> Result<(StatusCode, Json<Notification>), ApiError> {
    let notification = notification_service::create_notification(
        state.store.as_ref(),
        state.bus.as_ref(),
        body,
        state.clock.now(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(notification)))
}

/// DELETE /api/admin/notifications/{notification_id}
pub async fn delete_notification(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    notification_service::delete_notification(
        state.store.as_ref(),
        state.bus.as_ref(),
        notification_id,
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}
