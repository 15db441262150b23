//! Canonical storefront records
//!
//! Every store backend produces these types; nothing above the store layer
//! sees raw rows or upstream JSON shapes.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Error returned when a stored enum column holds an unknown value
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// ============================================================================
// WALLET / LEDGER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: String,
    pub balance_minor: i64,
    pub points_balance: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    /// Never moves backwards; clients order wallet snapshots by it
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Wallet top-up
    Charge,
    /// Spend from the wallet
    Payment,
    Refund,
    Transfer,
}

string_enum!(TransactionType, "transaction_type", {
    Charge => "charge",
    Payment => "payment",
    Refund => "refund",
    Transfer => "transfer",
});

impl TransactionType {
    /// Whether `amount_minor` has the sign this kind of movement requires.
    pub fn accepts_amount(&self, amount_minor: i64) -> bool {
        match self {
            Self::Charge | Self::Refund => amount_minor > 0,
            Self::Payment => amount_minor < 0,
            Self::Transfer => amount_minor != 0,
        }
    }

    /// Debits never overdraw the wallet.
    pub fn requires_funds(&self, amount_minor: i64) -> bool {
        amount_minor < 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Completed,
}

string_enum!(TransactionStatus, "transaction_status", {
    Completed => "completed",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub transaction_type: TransactionType,
    pub amount_minor: i64,
    pub balance_after_minor: i64,
    pub status: TransactionStatus,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PointsEntry {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub delta: i64,
    pub balance_after: i64,
    pub reason: String,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MonthlyStats {
    pub user_id: String,
    pub month: String,
    pub points_earned: i64,
    pub profit_earned_minor: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    DailyGame,
    AiInteraction,
}

string_enum!(RewardKind, "reward_kind", {
    DailyGame => "daily_game",
    AiInteraction => "ai_interaction",
});

/// Money movement handed to the store as one atomic unit
#[derive(Debug, Clone)]
pub struct MoneyMutation {
    pub user_id: String,
    pub amount_minor: i64,
    pub transaction_type: TransactionType,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
    pub month: String,
}

#[derive(Debug, Clone)]
pub struct MoneyOutcome {
    pub wallet: Wallet,
    pub transaction: WalletTransaction,
    /// True when the idempotency key matched an earlier mutation
    pub replayed: bool,
}

#[derive(Debug, Clone)]
pub struct PointsMutation {
    pub user_id: String,
    pub delta: i64,
    pub reason: String,
    pub idempotency_key: Option<String>,
    pub month: String,
}

#[derive(Debug, Clone)]
pub struct PointsOutcome {
    pub wallet: Wallet,
    pub entry: PointsEntry,
    pub replayed: bool,
}

#[derive(Debug, Clone)]
pub struct RewardClaim {
    pub user_id: String,
    pub kind: RewardKind,
    pub claim_date: NaiveDate,
    pub points: i64,
    pub month: String,
}

#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Awarded(PointsOutcome),
    AlreadyClaimed,
}

// ============================================================================
// CATALOG / CART / ORDERS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Product {
    pub id: String,
    pub name_en: String,
    pub name_ar: String,
    pub price_minor: i64,
    pub category_id: Option<String>,
    pub image_url: Option<String>,
    pub is_active: bool,
}

impl Product {
    /// Highest accepted unit price (one billion in major units)
    pub const MAX_PRICE_MINOR: i64 = 100_000_000_000;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CartItem {
    pub user_id: String,
    pub product_id: String,
    pub product_name: String,
    pub quantity: i32,
    /// Price captured when the product was first added
    pub price_minor: i64,
    pub added_at: DateTime<Utc>,
}

impl CartItem {
    /// `None` on overflow
    pub fn line_total_minor(&self) -> Option<i64> {
        self.price_minor.checked_mul(i64::from(self.quantity))
    }

    /// Sum of line totals; `None` on overflow
    pub fn cart_total_minor(items: &[CartItem]) -> Option<i64> {
        items
            .iter()
            .try_fold(0i64, |total, item| total.checked_add(item.line_total_minor()?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingConfirmation,
    Confirmed,
    Preparing,
    Shipping,
    Delivered,
}

string_enum!(OrderStatus, "order_status", {
    PendingConfirmation => "pending_confirmation",
    Confirmed => "confirmed",
    Preparing => "preparing",
    Shipping => "shipping",
    Delivered => "delivered",
});

impl OrderStatus {
    /// The only status an admin may move an order to from `self`.
    pub fn next(&self) -> Option<OrderStatus> {
        match self {
            Self::PendingConfirmation => Some(Self::Confirmed),
            Self::Confirmed => Some(Self::Preparing),
            Self::Preparing => Some(Self::Shipping),
            Self::Shipping => Some(Self::Delivered),
            Self::Delivered => None,
        }
    }

    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        self.next() == Some(to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Wallet,
    Card,
    CashOnDelivery,
}

string_enum!(PaymentMethod, "payment_method", {
    Wallet => "wallet",
    Card => "card",
    CashOnDelivery => "cash_on_delivery",
});

impl PaymentMethod {
    pub fn initial_status(&self) -> OrderStatus {
        match self {
            Self::Wallet => OrderStatus::Confirmed,
            Self::Card | Self::CashOnDelivery => OrderStatus::PendingConfirmation,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAddress {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub street: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub building: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl DeliveryAddress {
    pub fn is_complete(&self) -> bool {
        [&self.phone, &self.city, &self.street]
            .iter()
            .all(|field| !field.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: String,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price_minor: i64,
    pub line_total_minor: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    pub user_id: String,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
    pub total_minor: i64,
    pub points_awarded: i64,
    pub delivery_address: DeliveryAddress,
    pub notes: Option<String>,
    pub items: Vec<OrderItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything the store needs to place an order atomically
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_id: Uuid,
    pub order_number: String,
    pub user_id: String,
    pub payment_method: PaymentMethod,
    pub delivery_address: DeliveryAddress,
    pub notes: Option<String>,
    pub points_rate_percent: i64,
    pub month: String,
    pub placed_at: DateTime<Utc>,
}

/// Status change handed to the store as a compare-and-set
#[derive(Debug, Clone)]
pub struct OrderTransition {
    pub order_id: Uuid,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub at: DateTime<Utc>,
}

// ============================================================================
// NOTIFICATIONS
// ============================================================================

/// Who a notification is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Audience {
    All,
    User(String),
}

impl Audience {
    pub const ALL: &'static str = "all";

    pub fn parse(raw: &str) -> Option<Audience> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else if trimmed == Self::ALL {
            Some(Audience::All)
        } else {
            Some(Audience::User(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Audience::All => Self::ALL,
            Audience::User(user_id) => user_id,
        }
    }

    pub fn includes(&self, user_id: &str) -> bool {
        match self {
            Audience::All => true,
            Audience::User(target) => target == user_id,
        }
    }
}

impl Serialize for Audience {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Audience {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Audience::parse(&raw).ok_or_else(|| serde::de::Error::custom("audience must not be empty"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub title: String,
    pub body: String,
    pub audience: Audience,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationView {
    #[serde(flatten)]
    pub notification: Notification,
    pub read: bool,
}

// ============================================================================
// OUTBOX
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOutboxEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxRecord {
    pub id: i64,
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
