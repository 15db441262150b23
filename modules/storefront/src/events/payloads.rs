use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Notification, OrderStatus, PaymentMethod};

/// Outbox event types
pub mod event_types {
    pub const ORDER_POINTS_AWARD: &str = "order.points_award";
    pub const ORDER_CONFIRMATION_EMAIL: &str = "order.confirmation_email";
    pub const ORDER_STATUS_CHANGED: &str = "order.status_changed";
}

// ============================================================================
// OUTBOX PAYLOADS
// ============================================================================

/// Payload for order.points_award
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPointsAwardPayload {
    pub order_id: Uuid,
    pub order_number: String,
    pub user_id: String,
    pub points: i64,
}

/// Payload for order.confirmation_email
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfirmationEmailPayload {
    pub order_id: Uuid,
    pub order_number: String,
    pub user_id: String,
    pub total_minor: i64,
    pub payment_method: PaymentMethod,
    pub item_count: i32,
}

/// Payload for order.status_changed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusChangedPayload {
    pub order_id: Uuid,
    pub order_number: String,
    pub user_id: String,
    pub from: OrderStatus,
    pub to: OrderStatus,
}

// ============================================================================
// REAL-TIME PAYLOADS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEventKind {
    Created,
    Deleted,
}

impl NotificationEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Deleted => "deleted",
        }
    }
}

/// Published on `storefront.notifications.<kind>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub kind: NotificationEventKind,
    pub notification: Notification,
}
