//! Cart and order placement
//!
//! Request validation happens here, before anything is written. The store
//! then prices the cart, debits the wallet, persists the order and enqueues
//! its side effects in one atomic unit.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{valid_user_id, LedgerPolicy};
use crate::models::{
    CartItem, DeliveryAddress, NewOrder, Order, OrderStatus, OrderTransition, PaymentMethod,
};
use crate::store::{OrderStore, StoreError, MAX_LINE_QUANTITY};

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("Invalid user id")]
    InvalidUser,

    #[error("Quantity must be between 1 and {max}: {quantity}")]
    InvalidQuantity { quantity: i32, max: i32 },

    #[error("Product not found: {0}")]
    ProductNotFound(String),

    #[error("Product unavailable: {0}")]
    ProductUnavailable(String),

    #[error("Cart item not found: {0}")]
    CartItemNotFound(String),

    #[error("Delivery address is missing or incomplete")]
    MissingAddress,

    #[error("Cart is empty")]
    EmptyCart,

    #[error("Insufficient balance: available {available}, required {required}")]
    InsufficientBalance { available: i64, required: i64 },

    #[error("Order not found: {0}")]
    OrderNotFound(Uuid),

    #[error("Cannot move order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for CheckoutError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::EmptyCart => CheckoutError::EmptyCart,
            StoreError::InsufficientFunds {
                available,
                required,
            } => CheckoutError::InsufficientBalance {
                available,
                required,
            },
            StoreError::ProductUnavailable(id) => CheckoutError::ProductUnavailable(id),
            other => CheckoutError::Store(other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartSummary {
    pub user_id: String,
    pub items: Vec<CartItem>,
    pub item_count: i32,
    pub total_minor: i64,
}

#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub user_id: String,
    pub payment_method: PaymentMethod,
    pub delivery_address: Option<DeliveryAddress>,
    pub notes: Option<String>,
}

const CROCKFORD_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Human-readable order number: `ORD-YYYYMMDD-XXXXXX`.
/// The suffix is the top 30 bits of the order id in Crockford base32.
pub fn generate_order_number(order_id: Uuid, day: NaiveDate) -> String {
    let bits = order_id.as_bytes()[..4]
        .iter()
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
        >> 2;

    let suffix: String = (0..6)
        .map(|i| {
            let index = (bits >> (25 - 5 * i)) & 0x1f;
            char::from(CROCKFORD_ALPHABET[index as usize])
        })
        .collect();

    format!("ORD-{}-{}", day.format("%Y%m%d"), suffix)
}

fn check_user(user_id: &str) -> Result<(), CheckoutError> {
    if valid_user_id(user_id) {
        Ok(())
    } else {
        Err(CheckoutError::InvalidUser)
    }
}

pub async fn add_to_cart<S: OrderStore + ?Sized>(
    store: &S,
    user_id: &str,
    product_id: &str,
    quantity: i32,
    now: DateTime<Utc>,
) -> Result<CartItem, CheckoutError> {
    check_user(user_id)?;
    if !(1..=MAX_LINE_QUANTITY).contains(&quantity) {
        return Err(CheckoutError::InvalidQuantity {
            quantity,
            max: MAX_LINE_QUANTITY,
        });
    }

    store
        .add_to_cart(user_id, product_id, quantity, now)
        .await
        .map_err(|e| match e {
            StoreError::NotFound(_) => CheckoutError::ProductNotFound(product_id.to_string()),
            other => other.into(),
        })
}

/// Zero removes the line
pub async fn set_quantity<S: OrderStore + ?Sized>(
    store: &S,
    user_id: &str,
    product_id: &str,
    quantity: i32,
) -> Result<Option<CartItem>, CheckoutError> {
    check_user(user_id)?;
    if !(0..=MAX_LINE_QUANTITY).contains(&quantity) {
        return Err(CheckoutError::InvalidQuantity {
            quantity,
            max: MAX_LINE_QUANTITY,
        });
    }

    store
        .set_cart_quantity(user_id, product_id, quantity)
        .await
        .map_err(|e| match e {
            StoreError::NotFound(_) => CheckoutError::CartItemNotFound(product_id.to_string()),
            other => other.into(),
        })
}

pub async fn remove_from_cart<S: OrderStore + ?Sized>(
    store: &S,
    user_id: &str,
    product_id: &str,
) -> Result<(), CheckoutError> {
    check_user(user_id)?;
    if store.remove_from_cart(user_id, product_id).await? {
        Ok(())
    } else {
        Err(CheckoutError::CartItemNotFound(product_id.to_string()))
    }
}

pub async fn cart_summary<S: OrderStore + ?Sized>(
    store: &S,
    user_id: &str,
) -> Result<CartSummary, CheckoutError> {
    check_user(user_id)?;
    let items = store.list_cart(user_id).await?;
    let total_minor = CartItem::cart_total_minor(&items)
        .ok_or_else(|| StoreError::AmountOutOfRange(format!("cart total for {}", user_id)))?;
    Ok(CartSummary {
        user_id: user_id.to_string(),
        item_count: items.iter().map(|i| i.quantity).sum(),
        total_minor,
        items,
    })
}

pub async fn place_order<S: OrderStore + ?Sized>(
    store: &S,
    policy: &LedgerPolicy,
    request: PlaceOrder,
    now: DateTime<Utc>,
) -> Result<Order, CheckoutError> {
    check_user(&request.user_id)?;

    let delivery_address = match request.delivery_address {
        Some(address) if address.is_complete() => address,
        _ => return Err(CheckoutError::MissingAddress),
    };

    let order_id = Uuid::new_v4();
    let new_order = NewOrder {
        order_id,
        order_number: generate_order_number(order_id, policy.calendar.day(now)),
        user_id: request.user_id,
        payment_method: request.payment_method,
        delivery_address,
        notes: request.notes.filter(|n| !n.trim().is_empty()),
        points_rate_percent: policy.points_rate_percent,
        month: policy.calendar.month_key(now),
        placed_at: now,
    };

    let order = store.place_order(&new_order, &policy.currency).await?;

    tracing::info!(
        order_id = %order.id,
        order_number = %order.order_number,
        user_id = %order.user_id,
        payment_method = %order.payment_method,
        total_minor = order.total_minor,
        points_awarded = order.points_awarded,
        status = %order.status,
        "Order placed"
    );

    Ok(order)
}

/// Admin action: move an order exactly one step along its lifecycle
pub async fn advance_order<S: OrderStore + ?Sized>(
    store: &S,
    order_id: Uuid,
    to: OrderStatus,
    now: DateTime<Utc>,
) -> Result<Order, CheckoutError> {
    let current = store
        .find_order(order_id)
        .await?
        .ok_or(CheckoutError::OrderNotFound(order_id))?;

    if !current.status.can_transition_to(to) {
        return Err(CheckoutError::InvalidTransition {
            from: current.status,
            to,
        });
    }

    let order = store
        .transition_order(&OrderTransition {
            order_id,
            from: current.status,
            to,
            at: now,
        })
        .await
        .map_err(|e| match e {
            // Another admin moved it first
            StoreError::Conflict(_) => CheckoutError::InvalidTransition {
                from: current.status,
                to,
            },
            StoreError::NotFound(_) => CheckoutError::OrderNotFound(order_id),
            other => other.into(),
        })?;

    tracing::info!(
        order_id = %order.id,
        from = %current.status,
        to = %order.status,
        "Order status changed"
    );

    Ok(order)
}

pub async fn find_order<S: OrderStore + ?Sized>(
    store: &S,
    order_id: Uuid,
) -> Result<Order, CheckoutError> {
    store
        .find_order(order_id)
        .await?
        .ok_or(CheckoutError::OrderNotFound(order_id))
}

pub async fn list_orders<S: OrderStore + ?Sized>(
    store: &S,
    user_id: &str,
    limit: i64,
) -> Result<Vec<Order>, CheckoutError> {
    check_user(user_id)?;
    Ok(store.list_orders(user_id, limit).await?)
}
