//! Persistence seam
//!
//! Every storefront operation that touches shared rows goes through one of
//! these traits. Each method is a single atomic unit: implementations must
//! not expose intermediate states (a balance changed without its
//! transaction record, an order without its outbox rows).
//!
//! ## Implementations
//!
//! - **PgStore**: production implementation on PostgreSQL; row locks and
//!   server-side increments inside one database transaction per call
//! - **InMemoryStore**: dev/test implementation; one mutex over all state

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::events::payloads::{
    event_types, OrderConfirmationEmailPayload, OrderPointsAwardPayload, OrderStatusChangedPayload,
};
use crate::models::{
    CartItem, ClaimOutcome, MoneyMutation, MoneyOutcome, MonthlyStats, NewOrder, NewOutboxEvent,
    Notification, NotificationView, Order, OrderStatus, OrderTransition, OutboxRecord, PointsEntry,
    PointsMutation, PointsOutcome, Product, RewardClaim, RewardKind, Wallet, WalletTransaction,
};

/// Errors that can occur during store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: i64, required: i64 },

    #[error("Insufficient points: available {available}, required {required}")]
    InsufficientPoints { available: i64, required: i64 },

    #[error("Cart is empty")]
    EmptyCart,

    #[error("Product unavailable: {0}")]
    ProductUnavailable(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Amount out of range: {0}")]
    AmountOutOfRange(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Read a wallet without creating it
    async fn find_wallet(&self, user_id: &str) -> StoreResult<Option<Wallet>>;

    /// Return the user's wallet, creating a zero wallet on first access
    async fn ensure_wallet(&self, user_id: &str, currency: &str) -> StoreResult<Wallet>;

    /// Atomically apply a money delta, append its transaction record and
    /// bump the monthly profit aggregate for credits
    async fn apply_money(&self, mutation: &MoneyMutation, currency: &str)
        -> StoreResult<MoneyOutcome>;

    /// Atomically apply a points delta, append its entry and bump the
    /// monthly points aggregate for awards
    async fn apply_points(
        &self,
        mutation: &PointsMutation,
        currency: &str,
    ) -> StoreResult<PointsOutcome>;

    /// Record a once-per-day reward claim and award its points in one unit
    async fn claim_reward(&self, claim: &RewardClaim, currency: &str)
        -> StoreResult<ClaimOutcome>;

    async fn has_claimed(
        &self,
        user_id: &str,
        kind: RewardKind,
        claim_date: NaiveDate,
    ) -> StoreResult<bool>;

    async fn monthly_stats(&self, user_id: &str, month: &str) -> StoreResult<Option<MonthlyStats>>;

    /// Newest first
    async fn list_transactions(&self, user_id: &str, limit: i64)
        -> StoreResult<Vec<WalletTransaction>>;

    /// Newest first
    async fn list_points_entries(&self, user_id: &str, limit: i64)
        -> StoreResult<Vec<PointsEntry>>;

    /// Sum of every transaction amount recorded for the user's wallet
    async fn transactions_sum(&self, user_id: &str) -> StoreResult<i64>;
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn upsert_product(&self, product: &Product) -> StoreResult<()>;

    async fn find_product(&self, product_id: &str) -> StoreResult<Option<Product>>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Add `quantity` of a product, snapshotting its current price on first add
    async fn add_to_cart(
        &self,
        user_id: &str,
        product_id: &str,
        quantity: i32,
        at: DateTime<Utc>,
    ) -> StoreResult<CartItem>;

    /// Replace the quantity of a cart line; zero removes it
    async fn set_cart_quantity(
        &self,
        user_id: &str,
        product_id: &str,
        quantity: i32,
    ) -> StoreResult<Option<CartItem>>;

    async fn remove_from_cart(&self, user_id: &str, product_id: &str) -> StoreResult<bool>;

    async fn list_cart(&self, user_id: &str) -> StoreResult<Vec<CartItem>>;

    /// Price the cart, debit the wallet when paying by wallet, persist the
    /// order and its items, clear the cart and enqueue the side effects.
    /// Nothing is written when any step fails.
    async fn place_order(&self, order: &NewOrder, currency: &str) -> StoreResult<Order>;

    async fn find_order(&self, order_id: Uuid) -> StoreResult<Option<Order>>;

    /// Newest first
    async fn list_orders(&self, user_id: &str, limit: i64) -> StoreResult<Vec<Order>>;

    /// Compare-and-set the status and enqueue the follow-up event together
    async fn transition_order(&self, transition: &OrderTransition) -> StoreResult<Order>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert_notification(&self, notification: &Notification) -> StoreResult<()>;

    async fn delete_notification(&self, notification_id: Uuid) -> StoreResult<Option<Notification>>;

    /// Notifications visible to the user, newest first, with read flags
    async fn list_notifications(&self, user_id: &str, limit: i64)
        -> StoreResult<Vec<NotificationView>>;

    /// Returns true when this call marked it read
    async fn mark_notification_read(
        &self,
        notification_id: Uuid,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn unread_count(&self, user_id: &str) -> StoreResult<i64>;
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn enqueue(&self, event: &NewOutboxEvent, at: DateTime<Utc>) -> StoreResult<()>;

    /// Unprocessed, not dead-lettered events due at or before `now`, oldest first
    async fn fetch_due(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<OutboxRecord>>;

    async fn mark_processed(&self, id: i64, at: DateTime<Utc>) -> StoreResult<()>;

    async fn mark_retry(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn mark_dead(&self, id: i64, error: &str, at: DateTime<Utc>) -> StoreResult<()>;

    async fn find_outbox_event(&self, event_id: Uuid) -> StoreResult<Option<OutboxRecord>>;
}

/// Everything the service needs from persistence
pub trait Store: LedgerStore + CatalogStore + OrderStore + NotificationStore + OutboxStore {}

impl<T> Store for T where T: LedgerStore + CatalogStore + OrderStore + NotificationStore + OutboxStore
{}

/// Points earned for an order total: `total * rate / 100` currency units,
/// rounded half up. Saturates at `i64::MAX`.
pub fn points_for_total(total_minor: i64, points_rate_percent: i64) -> i64 {
    if total_minor <= 0 || points_rate_percent <= 0 {
        return 0;
    }
    let points = (i128::from(total_minor) * i128::from(points_rate_percent) + 5_000) / 10_000;
    i64::try_from(points).unwrap_or(i64::MAX)
}

/// Reject prices outside `0..=Product::MAX_PRICE_MINOR` before they reach a cart
pub fn check_price(product: &Product) -> StoreResult<()> {
    if (0..=Product::MAX_PRICE_MINOR).contains(&product.price_minor) {
        Ok(())
    } else {
        Err(StoreError::AmountOutOfRange(format!(
            "price of {} is {}",
            product.id, product.price_minor
        )))
    }
}

/// Checked total of `(unit price, quantity)` lines
pub fn order_total(lines: impl IntoIterator<Item = (i64, i32)>) -> StoreResult<i64> {
    lines
        .into_iter()
        .try_fold(0i64, |total, (price_minor, quantity)| {
            price_minor
                .checked_mul(i64::from(quantity))
                .and_then(|line| total.checked_add(line))
        })
        .ok_or_else(|| StoreError::AmountOutOfRange("order total overflows".to_string()))
}

/// Side effects committed together with a freshly placed order
pub fn order_side_effects(order: &Order) -> Vec<NewOutboxEvent> {
    let mut events = Vec::with_capacity(2);

    if order.points_awarded > 0 {
        events.push(outbox_event(
            event_types::ORDER_POINTS_AWARD,
            order,
            &OrderPointsAwardPayload {
                order_id: order.id,
                order_number: order.order_number.clone(),
                user_id: order.user_id.clone(),
                points: order.points_awarded,
            },
        ));
    }

    events.push(outbox_event(
        event_types::ORDER_CONFIRMATION_EMAIL,
        order,
        &OrderConfirmationEmailPayload {
            order_id: order.id,
            order_number: order.order_number.clone(),
            user_id: order.user_id.clone(),
            total_minor: order.total_minor,
            payment_method: order.payment_method,
            item_count: order.items.iter().map(|i| i.quantity).sum(),
        },
    ));

    events
}

/// Follow-up event committed together with an order status change
pub fn status_changed_event(order: &Order, from: OrderStatus) -> NewOutboxEvent {
    outbox_event(
        event_types::ORDER_STATUS_CHANGED,
        order,
        &OrderStatusChangedPayload {
            order_id: order.id,
            order_number: order.order_number.clone(),
            user_id: order.user_id.clone(),
            from,
            to: order.status,
        },
    )
}

fn outbox_event<T: serde::Serialize>(event_type: &str, order: &Order, payload: &T) -> NewOutboxEvent {
    NewOutboxEvent {
        event_id: Uuid::new_v4(),
        event_type: event_type.to_string(),
        aggregate_id: order.id.to_string(),
        payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
    }
}

/// Cart lines are capped at this quantity
pub const MAX_LINE_QUANTITY: i32 = 99;

/// Idempotency key of the points entry written for a reward claim
pub fn reward_claim_key(kind: RewardKind, claim_date: NaiveDate) -> String {
    format!("reward:{}:{}", kind, claim_date)
}

/// Idempotency key used for the wallet debit of an order
pub fn order_payment_key(order_id: Uuid) -> String {
    format!("order-payment:{}", order_id)
}

/// Idempotency key used for the points award of an order
pub fn order_award_key(order_id: Uuid) -> String {
    format!("order:{}", order_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_points_for_total() {
        // 100 EGP at 1.5 points per pound
        assert_eq!(points_for_total(10_000, 150), 150);
        // 33.33 EGP -> 49.995 -> 50
        assert_eq!(points_for_total(3_333, 150), 50);
        assert_eq!(points_for_total(0, 150), 0);
        assert_eq!(points_for_total(10_000, 0), 0);
        assert_eq!(points_for_total(i64::MAX, 150), i64::MAX);
    }

    #[test]
    fn test_order_total_is_checked() {
        assert_eq!(order_total([(3_250, 2), (500, 1)]).unwrap(), 7_000);
        assert!(matches!(
            order_total([(i64::MAX / 2, 3)]),
            Err(StoreError::AmountOutOfRange(_))
        ));
        assert!(matches!(
            order_total([(i64::MAX / 2, 1), (i64::MAX / 2, 1), (10, 1)]),
            Err(StoreError::AmountOutOfRange(_))
        ));
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::InsufficientFunds {
            available: 5_000,
            required: 10_000,
        };
        assert!(err.to_string().contains("10000"));
    }
}
