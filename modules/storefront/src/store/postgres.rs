//! PostgreSQL store
//!
//! Each trait call runs in one database transaction. Ledger mutations lock
//! the wallet row (`SELECT .. FOR UPDATE`) and change balances with
//! server-side increments; monthly aggregates use additive upserts.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::str::FromStr;
use uuid::Uuid;

use super::{
    check_price, order_payment_key, order_side_effects, order_total, points_for_total,
    reward_claim_key, status_changed_event, CatalogStore, LedgerStore, NotificationStore, OrderStore, OutboxStore,
    StoreError, StoreResult, MAX_LINE_QUANTITY,
};
use crate::models::{
    Audience, CartItem, ClaimOutcome, DeliveryAddress, MoneyMutation, MoneyOutcome, MonthlyStats,
    NewOrder, NewOutboxEvent, Notification, NotificationView, Order, OrderItem, OrderStatus,
    OrderTransition, OutboxRecord, PaymentMethod, PointsEntry, PointsMutation, PointsOutcome,
    Product, RewardClaim, RewardKind, TransactionStatus, TransactionType, UnknownVariant, Wallet,
    WalletTransaction,
};

const WALLET_COLUMNS: &str =
    "id, user_id, balance_minor, points_balance, currency, created_at, updated_at";
const TRANSACTION_COLUMNS: &str = "id, wallet_id, transaction_type, amount_minor, \
     balance_after_minor, status, description, idempotency_key, created_at";
const POINTS_COLUMNS: &str =
    "id, wallet_id, delta, balance_after, reason, idempotency_key, created_at";
const ORDER_COLUMNS: &str = "id, order_number, user_id, status, payment_method, total_minor, \
     points_awarded, delivery_address, notes, created_at, updated_at";
const ORDER_ITEM_COLUMNS: &str =
    "id, order_id, product_id, product_name, quantity, unit_price_minor, line_total_minor";
const CART_COLUMNS: &str = "user_id, product_id, product_name, quantity, price_minor, added_at";
const OUTBOX_COLUMNS: &str = "id, event_id, event_type, aggregate_id, payload, attempts, \
     next_attempt_at, last_error, processed_at, dead_lettered_at, created_at";

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    wallet_id: Uuid,
    transaction_type: String,
    amount_minor: i64,
    balance_after_minor: i64,
    status: String,
    description: Option<String>,
    idempotency_key: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for WalletTransaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(WalletTransaction {
            id: row.id,
            wallet_id: row.wallet_id,
            transaction_type: decode::<TransactionType>(&row.transaction_type)?,
            amount_minor: row.amount_minor,
            balance_after_minor: row.balance_after_minor,
            status: decode::<TransactionStatus>(&row.status)?,
            description: row.description,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct OrderRow {
    id: Uuid,
    order_number: String,
    user_id: String,
    status: String,
    payment_method: String,
    total_minor: i64,
    points_awarded: i64,
    delivery_address: Json<DeliveryAddress>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl OrderRow {
    fn into_order(self, items: Vec<OrderItem>) -> StoreResult<Order> {
        Ok(Order {
            id: self.id,
            order_number: self.order_number,
            user_id: self.user_id,
            status: decode::<OrderStatus>(&self.status)?,
            payment_method: decode::<PaymentMethod>(&self.payment_method)?,
            total_minor: self.total_minor,
            points_awarded: self.points_awarded,
            delivery_address: self.delivery_address.0,
            notes: self.notes,
            items,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct CartLineRow {
    user_id: String,
    product_id: String,
    product_name: String,
    quantity: i32,
    price_minor: i64,
    added_at: DateTime<Utc>,
    is_active: bool,
}

#[derive(Debug, FromRow)]
struct NotificationRow {
    id: Uuid,
    title: String,
    body: String,
    audience: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = StoreError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        let audience = Audience::parse(&row.audience).ok_or_else(|| {
            StoreError::Database(sqlx::Error::Decode(Box::new(UnknownVariant {
                kind: "audience",
                value: row.audience.clone(),
            })))
        })?;
        Ok(Notification {
            id: row.id,
            title: row.title,
            body: row.body,
            audience,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct NotificationViewRow {
    #[sqlx(flatten)]
    notification: NotificationRow,
    read: bool,
}

fn decode<T>(raw: &str) -> StoreResult<T>
where
    T: FromStr<Err = UnknownVariant>,
{
    raw.parse::<T>()
        .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))
}

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_items(&self, order_ids: &[Uuid]) -> StoreResult<Vec<OrderItem>> {
        let items = sqlx::query_as::<_, OrderItem>(&format!(
            "SELECT {} FROM order_items WHERE order_id = ANY($1) ORDER BY product_id",
            ORDER_ITEM_COLUMNS
        ))
        .bind(order_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }
}

// ============================================================================
// TRANSACTION HELPERS
// ============================================================================

/// Create the wallet if missing and lock its row for the rest of the transaction
async fn tx_lock_wallet(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &str,
    currency: &str,
) -> StoreResult<Wallet> {
    sqlx::query(
        r#"
        INSERT INTO wallets (user_id, currency)
        VALUES ($1, $2)
        ON CONFLICT (user_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(currency)
    .execute(&mut **tx)
    .await?;

    let wallet = sqlx::query_as::<_, Wallet>(&format!(
        "SELECT {} FROM wallets WHERE user_id = $1 FOR UPDATE",
        WALLET_COLUMNS
    ))
    .bind(user_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(wallet)
}

/// Additive upsert of the monthly aggregate; only positive deltas count
async fn tx_bump_monthly(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &str,
    month: &str,
    points: i64,
    profit_minor: i64,
) -> StoreResult<()> {
    if points <= 0 && profit_minor <= 0 {
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO user_monthly_stats (user_id, month, points_earned, profit_earned_minor, updated_at)
        VALUES ($1, $2, $3, $4, NOW())
        ON CONFLICT (user_id, month)
        DO UPDATE SET
            points_earned = user_monthly_stats.points_earned + EXCLUDED.points_earned,
            profit_earned_minor = user_monthly_stats.profit_earned_minor + EXCLUDED.profit_earned_minor,
            updated_at = NOW()
        "#,
    )
    .bind(user_id)
    .bind(month)
    .bind(points.max(0))
    .bind(profit_minor.max(0))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn tx_apply_money(
    tx: &mut Transaction<'_, Postgres>,
    mutation: &MoneyMutation,
    currency: &str,
) -> StoreResult<MoneyOutcome> {
    let wallet = tx_lock_wallet(tx, &mutation.user_id, currency).await?;

    if let Some(key) = &mutation.idempotency_key {
        let existing = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM wallet_transactions WHERE wallet_id = $1 AND idempotency_key = $2",
            TRANSACTION_COLUMNS
        ))
        .bind(wallet.id)
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(row) = existing {
            return Ok(MoneyOutcome {
                wallet,
                transaction: row.try_into()?,
                replayed: true,
            });
        }
    }

    if mutation.transaction_type.requires_funds(mutation.amount_minor)
        && wallet.balance_minor + mutation.amount_minor < 0
    {
        return Err(StoreError::InsufficientFunds {
            available: wallet.balance_minor,
            required: -mutation.amount_minor,
        });
    }

    let wallet = sqlx::query_as::<_, Wallet>(&format!(
        r#"
        UPDATE wallets
        SET balance_minor = balance_minor + $2,
            updated_at = GREATEST(updated_at, clock_timestamp())
        WHERE id = $1
        RETURNING {}
        "#,
        WALLET_COLUMNS
    ))
    .bind(wallet.id)
    .bind(mutation.amount_minor)
    .fetch_one(&mut **tx)
    .await?;

    let row = sqlx::query_as::<_, TransactionRow>(&format!(
        r#"
        INSERT INTO wallet_transactions (
            wallet_id, transaction_type, amount_minor, balance_after_minor,
            status, description, idempotency_key
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING {}
        "#,
        TRANSACTION_COLUMNS
    ))
    .bind(wallet.id)
    .bind(mutation.transaction_type.as_str())
    .bind(mutation.amount_minor)
    .bind(wallet.balance_minor)
    .bind(TransactionStatus::Completed.as_str())
    .bind(&mutation.description)
    .bind(&mutation.idempotency_key)
    .fetch_one(&mut **tx)
    .await?;

    tx_bump_monthly(tx, &mutation.user_id, &mutation.month, 0, mutation.amount_minor).await?;

    Ok(MoneyOutcome {
        wallet,
        transaction: row.try_into()?,
        replayed: false,
    })
}

async fn tx_apply_points(
    tx: &mut Transaction<'_, Postgres>,
    mutation: &PointsMutation,
    currency: &str,
) -> StoreResult<PointsOutcome> {
    let wallet = tx_lock_wallet(tx, &mutation.user_id, currency).await?;

    if let Some(key) = &mutation.idempotency_key {
        let existing = sqlx::query_as::<_, PointsEntry>(&format!(
            "SELECT {} FROM points_entries WHERE wallet_id = $1 AND idempotency_key = $2",
            POINTS_COLUMNS
        ))
        .bind(wallet.id)
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(entry) = existing {
            return Ok(PointsOutcome {
                wallet,
                entry,
                replayed: true,
            });
        }
    }

    if wallet.points_balance + mutation.delta < 0 {
        return Err(StoreError::InsufficientPoints {
            available: wallet.points_balance,
            required: -mutation.delta,
        });
    }

    let wallet = sqlx::query_as::<_, Wallet>(&format!(
        r#"
        UPDATE wallets
        SET points_balance = points_balance + $2,
            updated_at = GREATEST(updated_at, clock_timestamp())
        WHERE id = $1
        RETURNING {}
        "#,
        WALLET_COLUMNS
    ))
    .bind(wallet.id)
    .bind(mutation.delta)
    .fetch_one(&mut **tx)
    .await?;

    let entry = sqlx::query_as::<_, PointsEntry>(&format!(
        r#"
        INSERT INTO points_entries (wallet_id, delta, balance_after, reason, idempotency_key)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING {}
        "#,
        POINTS_COLUMNS
    ))
    .bind(wallet.id)
    .bind(mutation.delta)
    .bind(wallet.points_balance)
    .bind(&mutation.reason)
    .bind(&mutation.idempotency_key)
    .fetch_one(&mut **tx)
    .await?;

    tx_bump_monthly(tx, &mutation.user_id, &mutation.month, mutation.delta, 0).await?;

    Ok(PointsOutcome {
        wallet,
        entry,
        replayed: false,
    })
}

async fn tx_enqueue(
    tx: &mut Transaction<'_, Postgres>,
    event: &NewOutboxEvent,
    at: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO events_outbox (
            event_id, event_type, aggregate_id, payload, next_attempt_at, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $5)
        "#,
    )
    .bind(event.event_id)
    .bind(&event.event_type)
    .bind(&event.aggregate_id)
    .bind(&event.payload)
    .bind(at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

// ============================================================================
// TRAIT IMPLEMENTATIONS
// ============================================================================

#[async_trait]
impl LedgerStore for PgStore {
    async fn find_wallet(&self, user_id: &str) -> StoreResult<Option<Wallet>> {
        let wallet = sqlx::query_as::<_, Wallet>(&format!(
            "SELECT {} FROM wallets WHERE user_id = $1",
            WALLET_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(wallet)
    }

    async fn ensure_wallet(&self, user_id: &str, currency: &str) -> StoreResult<Wallet> {
        // The no-op update makes RETURNING yield the existing row on conflict
        let wallet = sqlx::query_as::<_, Wallet>(&format!(
            r#"
            INSERT INTO wallets (user_id, currency)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET user_id = EXCLUDED.user_id
            RETURNING {}
            "#,
            WALLET_COLUMNS
        ))
        .bind(user_id)
        .bind(currency)
        .fetch_one(&self.pool)
        .await?;
        Ok(wallet)
    }

    async fn apply_money(
        &self,
        mutation: &MoneyMutation,
        currency: &str,
    ) -> StoreResult<MoneyOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = tx_apply_money(&mut tx, mutation, currency).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn apply_points(
        &self,
        mutation: &PointsMutation,
        currency: &str,
    ) -> StoreResult<PointsOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = tx_apply_points(&mut tx, mutation, currency).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn claim_reward(&self, claim: &RewardClaim, currency: &str) -> StoreResult<ClaimOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO reward_claims (user_id, reward_kind, claim_date, points)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, reward_kind, claim_date) DO NOTHING
            "#,
        )
        .bind(&claim.user_id)
        .bind(claim.kind.as_str())
        .bind(claim.claim_date)
        .bind(claim.points)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(ClaimOutcome::AlreadyClaimed);
        }

        let outcome = tx_apply_points(
            &mut tx,
            &PointsMutation {
                user_id: claim.user_id.clone(),
                delta: claim.points,
                reason: claim.kind.as_str().to_string(),
                idempotency_key: Some(reward_claim_key(claim.kind, claim.claim_date)),
                month: claim.month.clone(),
            },
            currency,
        )
        .await?;

        sqlx::query(
            r#"
            UPDATE reward_claims SET points_entry_id = $4
            WHERE user_id = $1 AND reward_kind = $2 AND claim_date = $3
            "#,
        )
        .bind(&claim.user_id)
        .bind(claim.kind.as_str())
        .bind(claim.claim_date)
        .bind(outcome.entry.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ClaimOutcome::Awarded(outcome))
    }

    async fn has_claimed(
        &self,
        user_id: &str,
        kind: RewardKind,
        claim_date: NaiveDate,
    ) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM reward_claims
                WHERE user_id = $1 AND reward_kind = $2 AND claim_date = $3
            )
            "#,
        )
        .bind(user_id)
        .bind(kind.as_str())
        .bind(claim_date)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn monthly_stats(&self, user_id: &str, month: &str) -> StoreResult<Option<MonthlyStats>> {
        let stats = sqlx::query_as::<_, MonthlyStats>(
            r#"
            SELECT user_id, month, points_earned, profit_earned_minor, updated_at
            FROM user_monthly_stats
            WHERE user_id = $1 AND month = $2
            "#,
        )
        .bind(user_id)
        .bind(month)
        .fetch_optional(&self.pool)
        .await?;
        Ok(stats)
    }

    async fn list_transactions(
        &self,
        user_id: &str,
        limit: i64,
    ) -> StoreResult<Vec<WalletTransaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT t.id, t.wallet_id, t.transaction_type, t.amount_minor, t.balance_after_minor,
                   t.status, t.description, t.idempotency_key, t.created_at
            FROM wallet_transactions t
            JOIN wallets w ON w.id = t.wallet_id
            WHERE w.user_id = $1
            ORDER BY t.created_at DESC, t.id
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WalletTransaction::try_from).collect()
    }

    async fn list_points_entries(&self, user_id: &str, limit: i64) -> StoreResult<Vec<PointsEntry>> {
        let entries = sqlx::query_as::<_, PointsEntry>(
            r#"
            SELECT p.id, p.wallet_id, p.delta, p.balance_after, p.reason, p.idempotency_key,
                   p.created_at
            FROM points_entries p
            JOIN wallets w ON w.id = p.wallet_id
            WHERE w.user_id = $1
            ORDER BY p.created_at DESC, p.id
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn transactions_sum(&self, user_id: &str) -> StoreResult<i64> {
        let sum: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(t.amount_minor), 0)::BIGINT
            FROM wallet_transactions t
            JOIN wallets w ON w.id = t.wallet_id
            WHERE w.user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(sum)
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn upsert_product(&self, product: &Product) -> StoreResult<()> {
        check_price(product)?;
        sqlx::query(
            r#"
            INSERT INTO products (id, name_en, name_ar, price_minor, category_id, image_url, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                name_en = EXCLUDED.name_en,
                name_ar = EXCLUDED.name_ar,
                price_minor = EXCLUDED.price_minor,
                category_id = EXCLUDED.category_id,
                image_url = EXCLUDED.image_url,
                is_active = EXCLUDED.is_active,
                updated_at = NOW()
            "#,
        )
        .bind(&product.id)
        .bind(&product.name_en)
        .bind(&product.name_ar)
        .bind(product.price_minor)
        .bind(&product.category_id)
        .bind(&product.image_url)
        .bind(product.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_product(&self, product_id: &str) -> StoreResult<Option<Product>> {
        let product = sqlx::query_as::<_, Product>(
            r#"
            SELECT id, name_en, name_ar, price_minor, category_id, image_url, is_active
            FROM products WHERE id = $1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(product)
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn add_to_cart(
        &self,
        user_id: &str,
        product_id: &str,
        quantity: i32,
        at: DateTime<Utc>,
    ) -> StoreResult<CartItem> {
        let product = self
            .find_product(product_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("product {}", product_id)))?;
        if !product.is_active {
            return Err(StoreError::ProductUnavailable(product.id));
        }

        let item = sqlx::query_as::<_, CartItem>(&format!(
            r#"
            INSERT INTO cart_items (user_id, product_id, product_name, quantity, price_minor, added_at)
            VALUES ($1, $2, $3, LEAST($4, $7), $5, $6)
            ON CONFLICT (user_id, product_id)
            DO UPDATE SET quantity = LEAST(cart_items.quantity + EXCLUDED.quantity, $7)
            RETURNING {}
            "#,
            CART_COLUMNS
        ))
        .bind(user_id)
        .bind(&product.id)
        .bind(&product.name_en)
        .bind(quantity)
        .bind(product.price_minor)
        .bind(at)
        .bind(MAX_LINE_QUANTITY)
        .fetch_one(&self.pool)
        .await?;
        Ok(item)
    }

    async fn set_cart_quantity(
        &self,
        user_id: &str,
        product_id: &str,
        quantity: i32,
    ) -> StoreResult<Option<CartItem>> {
        if quantity <= 0 {
            let removed = self.remove_from_cart(user_id, product_id).await?;
            if !removed {
                return Err(StoreError::NotFound(format!("cart item {}", product_id)));
            }
            return Ok(None);
        }

        let item = sqlx::query_as::<_, CartItem>(&format!(
            r#"
            UPDATE cart_items SET quantity = LEAST($3, $4)
            WHERE user_id = $1 AND product_id = $2
            RETURNING {}
            "#,
            CART_COLUMNS
        ))
        .bind(user_id)
        .bind(product_id)
        .bind(quantity)
        .bind(MAX_LINE_QUANTITY)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("cart item {}", product_id)))?;
        Ok(Some(item))
    }

    async fn remove_from_cart(&self, user_id: &str, product_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM cart_items WHERE user_id = $1 AND product_id = $2")
            .bind(user_id)
            .bind(product_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_cart(&self, user_id: &str) -> StoreResult<Vec<CartItem>> {
        let items = sqlx::query_as::<_, CartItem>(&format!(
            "SELECT {} FROM cart_items WHERE user_id = $1 ORDER BY added_at, product_id",
            CART_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn place_order(&self, new_order: &NewOrder, currency: &str) -> StoreResult<Order> {
        let mut tx = self.pool.begin().await?;

        let lines = sqlx::query_as::<_, CartLineRow>(
            r#"
            SELECT c.user_id, c.product_id, c.product_name, c.quantity, c.price_minor, c.added_at,
                   p.is_active
            FROM cart_items c
            JOIN products p ON p.id = c.product_id
            WHERE c.user_id = $1
            ORDER BY c.added_at, c.product_id
            FOR UPDATE OF c
            "#,
        )
        .bind(&new_order.user_id)
        .fetch_all(&mut *tx)
        .await?;

        if lines.is_empty() {
            return Err(StoreError::EmptyCart);
        }
        if let Some(line) = lines.iter().find(|l| !l.is_active) {
            return Err(StoreError::ProductUnavailable(line.product_id.clone()));
        }

        let total_minor = order_total(lines.iter().map(|l| (l.price_minor, l.quantity)))?;

        // Funds are checked under the wallet row lock; an error here rolls
        // back the whole order.
        if new_order.payment_method == PaymentMethod::Wallet && total_minor > 0 {
            tx_apply_money(
                &mut tx,
                &MoneyMutation {
                    user_id: new_order.user_id.clone(),
                    amount_minor: -total_minor,
                    transaction_type: TransactionType::Payment,
                    description: Some(format!("Order {}", new_order.order_number)),
                    idempotency_key: Some(order_payment_key(new_order.order_id)),
                    month: new_order.month.clone(),
                },
                currency,
            )
            .await?;
        }

        let status = new_order.payment_method.initial_status();
        let points_awarded = points_for_total(total_minor, new_order.points_rate_percent);

        let row = sqlx::query_as::<_, OrderRow>(&format!(
            r#"
            INSERT INTO orders (
                id, order_number, user_id, status, payment_method, total_minor,
                points_awarded, delivery_address, notes, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(new_order.order_id)
        .bind(&new_order.order_number)
        .bind(&new_order.user_id)
        .bind(status.as_str())
        .bind(new_order.payment_method.as_str())
        .bind(total_minor)
        .bind(points_awarded)
        .bind(Json(&new_order.delivery_address))
        .bind(&new_order.notes)
        .bind(new_order.placed_at)
        .fetch_one(&mut *tx)
        .await?;

        let mut items = Vec::with_capacity(lines.len());
        for line in &lines {
            let item = sqlx::query_as::<_, OrderItem>(&format!(
                r#"
                INSERT INTO order_items (
                    id, order_id, product_id, product_name, quantity,
                    unit_price_minor, line_total_minor
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING {}
                "#,
                ORDER_ITEM_COLUMNS
            ))
            .bind(Uuid::new_v4())
            .bind(new_order.order_id)
            .bind(&line.product_id)
            .bind(&line.product_name)
            .bind(line.quantity)
            .bind(line.price_minor)
            // Bounded by the checked total above
            .bind(line.price_minor * i64::from(line.quantity))
            .fetch_one(&mut *tx)
            .await?;
            items.push(item);
        }

        sqlx::query("DELETE FROM cart_items WHERE user_id = $1")
            .bind(&new_order.user_id)
            .execute(&mut *tx)
            .await?;

        let order = row.into_order(items)?;
        for event in order_side_effects(&order) {
            tx_enqueue(&mut tx, &event, new_order.placed_at).await?;
        }

        tx.commit().await?;

        tracing::debug!(
            order_id = %order.id,
            cart_lines = lines.len(),
            "Order rows committed"
        );
        Ok(order)
    }

    async fn find_order(&self, order_id: Uuid) -> StoreResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {} FROM orders WHERE id = $1",
            ORDER_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let items = self.load_items(&[row.id]).await?;
                Ok(Some(row.into_order(items)?))
            }
            None => Ok(None),
        }
    }

    async fn list_orders(&self, user_id: &str, limit: i64) -> StoreResult<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {} FROM orders WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
            ORDER_COLUMNS
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let mut items = self.load_items(&ids).await?;

        rows.into_iter()
            .map(|row| {
                let (own, rest): (Vec<OrderItem>, Vec<OrderItem>) =
                    items.drain(..).partition(|i| i.order_id == row.id);
                items = rest;
                row.into_order(own)
            })
            .collect()
    }

    async fn transition_order(&self, transition: &OrderTransition) -> StoreResult<Order> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, OrderRow>(&format!(
            r#"
            UPDATE orders SET status = $3, updated_at = $4
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(transition.order_id)
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(transition.at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            let current: Option<String> =
                sqlx::query_scalar("SELECT status FROM orders WHERE id = $1")
                    .bind(transition.order_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match current {
                Some(status) => StoreError::Conflict(format!(
                    "order {} is {}, expected {}",
                    transition.order_id, status, transition.from
                )),
                None => StoreError::NotFound(format!("order {}", transition.order_id)),
            });
        };

        let items = sqlx::query_as::<_, OrderItem>(&format!(
            "SELECT {} FROM order_items WHERE order_id = $1 ORDER BY product_id",
            ORDER_ITEM_COLUMNS
        ))
        .bind(transition.order_id)
        .fetch_all(&mut *tx)
        .await?;

        let order = row.into_order(items)?;
        tx_enqueue(&mut tx, &status_changed_event(&order, transition.from), transition.at).await?;

        tx.commit().await?;
        Ok(order)
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn insert_notification(&self, notification: &Notification) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, title, body, audience, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(notification.id)
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(notification.audience.as_str())
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_notification(&self, notification_id: Uuid) -> StoreResult<Option<Notification>> {
        let row = sqlx::query_as::<_, NotificationRow>(
            r#"
            DELETE FROM notifications WHERE id = $1
            RETURNING id, title, body, audience, created_at
            "#,
        )
        .bind(notification_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Notification::try_from).transpose()
    }

    async fn list_notifications(
        &self,
        user_id: &str,
        limit: i64,
    ) -> StoreResult<Vec<NotificationView>> {
        let rows = sqlx::query_as::<_, NotificationViewRow>(
            r#"
            SELECT n.id, n.title, n.body, n.audience, n.created_at,
                   (r.user_id IS NOT NULL) AS read
            FROM notifications n
            LEFT JOIN notification_reads r
                ON r.notification_id = n.id AND r.user_id = $1
            WHERE n.audience = 'all' OR n.audience = $1
            ORDER BY n.created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(NotificationView {
                    notification: row.notification.try_into()?,
                    read: row.read,
                })
            })
            .collect()
    }

    async fn mark_notification_read(
        &self,
        notification_id: Uuid,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let visible: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM notifications
                WHERE id = $1 AND (audience = 'all' OR audience = $2)
            )
            "#,
        )
        .bind(notification_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        if !visible {
            return Err(StoreError::NotFound(format!("notification {}", notification_id)));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO notification_reads (notification_id, user_id, read_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (notification_id, user_id) DO NOTHING
            "#,
        )
        .bind(notification_id)
        .bind(user_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn unread_count(&self, user_id: &str) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM notifications n
            WHERE (n.audience = 'all' OR n.audience = $1)
              AND NOT EXISTS (
                  SELECT 1 FROM notification_reads r
                  WHERE r.notification_id = n.id AND r.user_id = $1
              )
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn enqueue(&self, event: &NewOutboxEvent, at: DateTime<Utc>) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        tx_enqueue(&mut tx, event, at).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_due(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<OutboxRecord>> {
        let rows = sqlx::query_as::<_, OutboxRecord>(&format!(
            r#"
            SELECT {}
            FROM events_outbox
            WHERE processed_at IS NULL
              AND dead_lettered_at IS NULL
              AND next_attempt_at <= $1
            ORDER BY id
            LIMIT $2
            "#,
            OUTBOX_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn mark_processed(&self, id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE events_outbox SET processed_at = $2, last_error = NULL WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        ensure_outbox_row(result.rows_affected(), id)
    }

    async fn mark_retry(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE events_outbox
            SET attempts = attempts + 1, last_error = $2, next_attempt_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;
        ensure_outbox_row(result.rows_affected(), id)
    }

    async fn mark_dead(&self, id: i64, error: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE events_outbox
            SET attempts = attempts + 1, last_error = $2, dead_lettered_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(at)
        .execute(&self.pool)
        .await?;
        ensure_outbox_row(result.rows_affected(), id)
    }

    async fn find_outbox_event(&self, event_id: Uuid) -> StoreResult<Option<OutboxRecord>> {
        let row = sqlx::query_as::<_, OutboxRecord>(&format!(
            "SELECT {} FROM events_outbox WHERE event_id = $1",
            OUTBOX_COLUMNS
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

fn ensure_outbox_row(rows_affected: u64, id: i64) -> StoreResult<()> {
    if rows_affected == 0 {
        return Err(StoreError::NotFound(format!("outbox event {}", id)));
    }
    Ok(())
}
