//! In-memory store
//!
//! All state sits behind one mutex and every trait call is a single critical
//! section, so concurrent callers observe the same serial order the Postgres
//! row locks produce. Nothing is awaited while the lock is held.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    check_price, order_payment_key, order_side_effects, order_total, points_for_total,
    reward_claim_key, status_changed_event, CatalogStore, LedgerStore, NotificationStore, OrderStore, OutboxStore,
    StoreError, StoreResult, MAX_LINE_QUANTITY,
};
use crate::models::{
    CartItem, ClaimOutcome, MoneyMutation, MoneyOutcome, MonthlyStats, NewOrder, NewOutboxEvent,
    Notification, NotificationView, Order, OrderItem, OrderTransition, OutboxRecord,
    PaymentMethod, PointsEntry, PointsMutation, PointsOutcome, Product, RewardClaim, RewardKind,
    TransactionStatus, TransactionType, Wallet, WalletTransaction,
};

#[derive(Default)]
struct State {
    wallets: HashMap<String, Wallet>,
    transactions: Vec<WalletTransaction>,
    points_entries: Vec<PointsEntry>,
    monthly: HashMap<(String, String), MonthlyStats>,
    claims: HashSet<(String, RewardKind, NaiveDate)>,
    products: HashMap<String, Product>,
    carts: HashMap<String, Vec<CartItem>>,
    orders: HashMap<Uuid, Order>,
    notifications: Vec<Notification>,
    reads: HashSet<(Uuid, String)>,
    outbox: Vec<OutboxRecord>,
    next_outbox_id: i64,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }
}

impl State {
    fn ensure_wallet(&mut self, user_id: &str, currency: &str) -> &mut Wallet {
        self.wallets.entry(user_id.to_string()).or_insert_with(|| {
            let now = Utc::now();
            Wallet {
                id: Uuid::new_v4(),
                user_id: user_id.to_string(),
                balance_minor: 0,
                points_balance: 0,
                currency: currency.to_string(),
                created_at: now,
                updated_at: now,
            }
        })
    }

    fn bump_monthly(&mut self, user_id: &str, month: &str, points: i64, profit_minor: i64) {
        if points <= 0 && profit_minor <= 0 {
            return;
        }
        let now = Utc::now();
        let row = self
            .monthly
            .entry((user_id.to_string(), month.to_string()))
            .or_insert_with(|| MonthlyStats {
                user_id: user_id.to_string(),
                month: month.to_string(),
                points_earned: 0,
                profit_earned_minor: 0,
                updated_at: now,
            });
        row.points_earned += points.max(0);
        row.profit_earned_minor += profit_minor.max(0);
        row.updated_at = now;
    }

    fn apply_money(&mut self, mutation: &MoneyMutation, currency: &str) -> StoreResult<MoneyOutcome> {
        let wallet = self.ensure_wallet(&mutation.user_id, currency).clone();

        if let Some(key) = &mutation.idempotency_key {
            if let Some(existing) = self
                .transactions
                .iter()
                .find(|t| t.wallet_id == wallet.id && t.idempotency_key.as_deref() == Some(key))
            {
                return Ok(MoneyOutcome {
                    wallet,
                    transaction: existing.clone(),
                    replayed: true,
                });
            }
        }

        let new_balance = wallet.balance_minor + mutation.amount_minor;
        if mutation.transaction_type.requires_funds(mutation.amount_minor) && new_balance < 0 {
            return Err(StoreError::InsufficientFunds {
                available: wallet.balance_minor,
                required: -mutation.amount_minor,
            });
        }

        let now = Utc::now();
        let wallet = self.ensure_wallet(&mutation.user_id, currency);
        wallet.balance_minor = new_balance;
        wallet.updated_at = wallet.updated_at.max(now);
        let wallet = wallet.clone();

        let transaction = WalletTransaction {
            id: Uuid::new_v4(),
            wallet_id: wallet.id,
            transaction_type: mutation.transaction_type,
            amount_minor: mutation.amount_minor,
            balance_after_minor: new_balance,
            status: TransactionStatus::Completed,
            description: mutation.description.clone(),
            idempotency_key: mutation.idempotency_key.clone(),
            created_at: now,
        };
        self.transactions.push(transaction.clone());
        self.bump_monthly(&mutation.user_id, &mutation.month, 0, mutation.amount_minor);

        Ok(MoneyOutcome {
            wallet,
            transaction,
            replayed: false,
        })
    }

    fn apply_points(
        &mut self,
        mutation: &PointsMutation,
        currency: &str,
    ) -> StoreResult<PointsOutcome> {
        let wallet = self.ensure_wallet(&mutation.user_id, currency).clone();

        if let Some(key) = &mutation.idempotency_key {
            if let Some(existing) = self
                .points_entries
                .iter()
                .find(|e| e.wallet_id == wallet.id && e.idempotency_key.as_deref() == Some(key))
            {
                return Ok(PointsOutcome {
                    wallet,
                    entry: existing.clone(),
                    replayed: true,
                });
            }
        }

        let new_balance = wallet.points_balance + mutation.delta;
        if new_balance < 0 {
            return Err(StoreError::InsufficientPoints {
                available: wallet.points_balance,
                required: -mutation.delta,
            });
        }

        let now = Utc::now();
        let wallet = self.ensure_wallet(&mutation.user_id, currency);
        wallet.points_balance = new_balance;
        wallet.updated_at = wallet.updated_at.max(now);
        let wallet = wallet.clone();

        let entry = PointsEntry {
            id: Uuid::new_v4(),
            wallet_id: wallet.id,
            delta: mutation.delta,
            balance_after: new_balance,
            reason: mutation.reason.clone(),
            idempotency_key: mutation.idempotency_key.clone(),
            created_at: now,
        };
        self.points_entries.push(entry.clone());
        self.bump_monthly(&mutation.user_id, &mutation.month, mutation.delta, 0);

        Ok(PointsOutcome {
            wallet,
            entry,
            replayed: false,
        })
    }

    fn enqueue(&mut self, event: &NewOutboxEvent, at: DateTime<Utc>) {
        self.next_outbox_id += 1;
        self.outbox.push(OutboxRecord {
            id: self.next_outbox_id,
            event_id: event.event_id,
            event_type: event.event_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            payload: event.payload.clone(),
            attempts: 0,
            next_attempt_at: at,
            last_error: None,
            processed_at: None,
            dead_lettered_at: None,
            created_at: at,
        });
    }

    fn outbox_row(&mut self, id: i64) -> StoreResult<&mut OutboxRecord> {
        self.outbox
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox event {}", id)))
    }

    fn wallet_id(&self, user_id: &str) -> Option<Uuid> {
        self.wallets.get(user_id).map(|w| w.id)
    }
}

fn newest_first<T: Clone>(rows: impl Iterator<Item = T>, limit: i64) -> Vec<T> {
    let mut rows: Vec<T> = rows.collect();
    rows.reverse();
    rows.truncate(limit.max(0) as usize);
    rows
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn find_wallet(&self, user_id: &str) -> StoreResult<Option<Wallet>> {
        Ok(self.lock()?.wallets.get(user_id).cloned())
    }

    async fn ensure_wallet(&self, user_id: &str, currency: &str) -> StoreResult<Wallet> {
        Ok(self.lock()?.ensure_wallet(user_id, currency).clone())
    }

    async fn apply_money(
        &self,
        mutation: &MoneyMutation,
        currency: &str,
    ) -> StoreResult<MoneyOutcome> {
        self.lock()?.apply_money(mutation, currency)
    }

    async fn apply_points(
        &self,
        mutation: &PointsMutation,
        currency: &str,
    ) -> StoreResult<PointsOutcome> {
        self.lock()?.apply_points(mutation, currency)
    }

    async fn claim_reward(&self, claim: &RewardClaim, currency: &str) -> StoreResult<ClaimOutcome> {
        let mut state = self.lock()?;
        let claim_key = (claim.user_id.clone(), claim.kind, claim.claim_date);
        if state.claims.contains(&claim_key) {
            return Ok(ClaimOutcome::AlreadyClaimed);
        }

        let outcome = state.apply_points(
            &PointsMutation {
                user_id: claim.user_id.clone(),
                delta: claim.points,
                reason: claim.kind.as_str().to_string(),
                idempotency_key: Some(reward_claim_key(claim.kind, claim.claim_date)),
                month: claim.month.clone(),
            },
            currency,
        )?;
        state.claims.insert(claim_key);

        Ok(ClaimOutcome::Awarded(outcome))
    }

    async fn has_claimed(
        &self,
        user_id: &str,
        kind: RewardKind,
        claim_date: NaiveDate,
    ) -> StoreResult<bool> {
        Ok(self
            .lock()?
            .claims
            .contains(&(user_id.to_string(), kind, claim_date)))
    }

    async fn monthly_stats(&self, user_id: &str, month: &str) -> StoreResult<Option<MonthlyStats>> {
        Ok(self
            .lock()?
            .monthly
            .get(&(user_id.to_string(), month.to_string()))
            .cloned())
    }

    async fn list_transactions(
        &self,
        user_id: &str,
        limit: i64,
    ) -> StoreResult<Vec<WalletTransaction>> {
        let state = self.lock()?;
        let Some(wallet_id) = state.wallet_id(user_id) else {
            return Ok(Vec::new());
        };
        Ok(newest_first(
            state.transactions.iter().filter(|t| t.wallet_id == wallet_id).cloned(),
            limit,
        ))
    }

    async fn list_points_entries(&self, user_id: &str, limit: i64) -> StoreResult<Vec<PointsEntry>> {
        let state = self.lock()?;
        let Some(wallet_id) = state.wallet_id(user_id) else {
            return Ok(Vec::new());
        };
        Ok(newest_first(
            state.points_entries.iter().filter(|e| e.wallet_id == wallet_id).cloned(),
            limit,
        ))
    }

    async fn transactions_sum(&self, user_id: &str) -> StoreResult<i64> {
        let state = self.lock()?;
        let Some(wallet_id) = state.wallet_id(user_id) else {
            return Ok(0);
        };
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.wallet_id == wallet_id)
            .map(|t| t.amount_minor)
            .sum())
    }
}

#[async_trait]
impl CatalogStore for InMemoryStore {
    async fn upsert_product(&self, product: &Product) -> StoreResult<()> {
        check_price(product)?;
        self.lock()?
            .products
            .insert(product.id.clone(), product.clone());
        Ok(())
    }

    async fn find_product(&self, product_id: &str) -> StoreResult<Option<Product>> {
        Ok(self.lock()?.products.get(product_id).cloned())
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn add_to_cart(
        &self,
        user_id: &str,
        product_id: &str,
        quantity: i32,
        at: DateTime<Utc>,
    ) -> StoreResult<CartItem> {
        let mut state = self.lock()?;
        let product = state
            .products
            .get(product_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("product {}", product_id)))?;
        if !product.is_active {
            return Err(StoreError::ProductUnavailable(product.id));
        }

        let cart = state.carts.entry(user_id.to_string()).or_default();
        if let Some(line) = cart.iter_mut().find(|l| l.product_id == product_id) {
            line.quantity = (line.quantity + quantity).min(MAX_LINE_QUANTITY);
            return Ok(line.clone());
        }

        let line = CartItem {
            user_id: user_id.to_string(),
            product_id: product.id,
            product_name: product.name_en,
            quantity: quantity.min(MAX_LINE_QUANTITY),
            price_minor: product.price_minor,
            added_at: at,
        };
        cart.push(line.clone());
        Ok(line)
    }

    async fn set_cart_quantity(
        &self,
        user_id: &str,
        product_id: &str,
        quantity: i32,
    ) -> StoreResult<Option<CartItem>> {
        let mut state = self.lock()?;
        let cart = state.carts.entry(user_id.to_string()).or_default();
        let position = cart
            .iter()
            .position(|l| l.product_id == product_id)
            .ok_or_else(|| StoreError::NotFound(format!("cart item {}", product_id)))?;

        if quantity <= 0 {
            cart.remove(position);
            return Ok(None);
        }
        cart[position].quantity = quantity.min(MAX_LINE_QUANTITY);
        Ok(Some(cart[position].clone()))
    }

    async fn remove_from_cart(&self, user_id: &str, product_id: &str) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let Some(cart) = state.carts.get_mut(user_id) else {
            return Ok(false);
        };
        let before = cart.len();
        cart.retain(|l| l.product_id != product_id);
        Ok(cart.len() != before)
    }

    async fn list_cart(&self, user_id: &str) -> StoreResult<Vec<CartItem>> {
        Ok(self.lock()?.carts.get(user_id).cloned().unwrap_or_default())
    }

    async fn place_order(&self, new_order: &NewOrder, currency: &str) -> StoreResult<Order> {
        let mut state = self.lock()?;
        let lines = state.carts.get(&new_order.user_id).cloned().unwrap_or_default();
        if lines.is_empty() {
            return Err(StoreError::EmptyCart);
        }

        for line in &lines {
            match state.products.get(&line.product_id) {
                Some(product) if product.is_active => {}
                _ => return Err(StoreError::ProductUnavailable(line.product_id.clone())),
            }
        }

        let total_minor = order_total(lines.iter().map(|l| (l.price_minor, l.quantity)))?;

        // The funds check inside apply_money runs before any order state is
        // written; a rejected debit leaves no order behind.
        if new_order.payment_method == PaymentMethod::Wallet && total_minor > 0 {
            state.apply_money(
                &MoneyMutation {
                    user_id: new_order.user_id.clone(),
                    amount_minor: -total_minor,
                    transaction_type: TransactionType::Payment,
                    description: Some(format!("Order {}", new_order.order_number)),
                    idempotency_key: Some(order_payment_key(new_order.order_id)),
                    month: new_order.month.clone(),
                },
                currency,
            )?;
        }

        let items = lines
            .iter()
            .map(|line| OrderItem {
                id: Uuid::new_v4(),
                order_id: new_order.order_id,
                product_id: line.product_id.clone(),
                product_name: line.product_name.clone(),
                quantity: line.quantity,
                unit_price_minor: line.price_minor,
                // Bounded by the checked total above
                line_total_minor: line.price_minor * i64::from(line.quantity),
            })
            .collect();

        let order = Order {
            id: new_order.order_id,
            order_number: new_order.order_number.clone(),
            user_id: new_order.user_id.clone(),
            status: new_order.payment_method.initial_status(),
            payment_method: new_order.payment_method,
            total_minor,
            points_awarded: points_for_total(total_minor, new_order.points_rate_percent),
            delivery_address: new_order.delivery_address.clone(),
            notes: new_order.notes.clone(),
            items,
            created_at: new_order.placed_at,
            updated_at: new_order.placed_at,
        };

        state.orders.insert(order.id, order.clone());
        state.carts.remove(&new_order.user_id);
        for event in order_side_effects(&order) {
            state.enqueue(&event, new_order.placed_at);
        }

        Ok(order)
    }

    async fn find_order(&self, order_id: Uuid) -> StoreResult<Option<Order>> {
        Ok(self.lock()?.orders.get(&order_id).cloned())
    }

    async fn list_orders(&self, user_id: &str, limit: i64) -> StoreResult<Vec<Order>> {
        let state = self.lock()?;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders.truncate(limit.max(0) as usize);
        Ok(orders)
    }

    async fn transition_order(&self, transition: &OrderTransition) -> StoreResult<Order> {
        let mut state = self.lock()?;
        let order = state
            .orders
            .get_mut(&transition.order_id)
            .ok_or_else(|| StoreError::NotFound(format!("order {}", transition.order_id)))?;

        if order.status != transition.from {
            return Err(StoreError::Conflict(format!(
                "order {} is {}, expected {}",
                order.id, order.status, transition.from
            )));
        }
        order.status = transition.to;
        order.updated_at = transition.at;
        let order = order.clone();

        let event = status_changed_event(&order, transition.from);
        state.enqueue(&event, transition.at);
        Ok(order)
    }
}

#[async_trait]
impl NotificationStore for InMemoryStore {
    async fn insert_notification(&self, notification: &Notification) -> StoreResult<()> {
        self.lock()?.notifications.push(notification.clone());
        Ok(())
    }

    async fn delete_notification(&self, notification_id: Uuid) -> StoreResult<Option<Notification>> {
        let mut state = self.lock()?;
        let Some(position) = state
            .notifications
            .iter()
            .position(|n| n.id == notification_id)
        else {
            return Ok(None);
        };
        let removed = state.notifications.remove(position);
        state.reads.retain(|(id, _)| *id != notification_id);
        Ok(Some(removed))
    }

    async fn list_notifications(
        &self,
        user_id: &str,
        limit: i64,
    ) -> StoreResult<Vec<NotificationView>> {
        let state = self.lock()?;
        let mut views: Vec<NotificationView> = state
            .notifications
            .iter()
            .filter(|n| n.audience.includes(user_id))
            .map(|n| NotificationView {
                notification: n.clone(),
                read: state.reads.contains(&(n.id, user_id.to_string())),
            })
            .collect();
        views.sort_by(|a, b| b.notification.created_at.cmp(&a.notification.created_at));
        views.truncate(limit.max(0) as usize);
        Ok(views)
    }

    async fn mark_notification_read(
        &self,
        notification_id: Uuid,
        user_id: &str,
        _at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let visible = state
            .notifications
            .iter()
            .any(|n| n.id == notification_id && n.audience.includes(user_id));
        if !visible {
            return Err(StoreError::NotFound(format!("notification {}", notification_id)));
        }
        Ok(state.reads.insert((notification_id, user_id.to_string())))
    }

    async fn unread_count(&self, user_id: &str) -> StoreResult<i64> {
        let state = self.lock()?;
        Ok(state
            .notifications
            .iter()
            .filter(|n| n.audience.includes(user_id))
            .filter(|n| !state.reads.contains(&(n.id, user_id.to_string())))
            .count() as i64)
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn enqueue(&self, event: &NewOutboxEvent, at: DateTime<Utc>) -> StoreResult<()> {
        self.lock()?.enqueue(event, at);
        Ok(())
    }

    async fn fetch_due(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<OutboxRecord>> {
        let state = self.lock()?;
        Ok(state
            .outbox
            .iter()
            .filter(|r| r.processed_at.is_none() && r.dead_lettered_at.is_none())
            .filter(|r| r.next_attempt_at <= now)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_processed(&self, id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.lock()?;
        let row = state.outbox_row(id)?;
        row.processed_at = Some(at);
        row.last_error = None;
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.lock()?;
        let row = state.outbox_row(id)?;
        row.attempts += 1;
        row.last_error = Some(error.to_string());
        row.next_attempt_at = next_attempt_at;
        Ok(())
    }

    async fn mark_dead(&self, id: i64, error: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.lock()?;
        let row = state.outbox_row(id)?;
        row.attempts += 1;
        row.last_error = Some(error.to_string());
        row.dead_lettered_at = Some(at);
        Ok(())
    }

    async fn find_outbox_event(&self, event_id: Uuid) -> StoreResult<Option<OutboxRecord>> {
        Ok(self
            .lock()?
            .outbox
            .iter()
            .find(|r| r.event_id == event_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Audience, DeliveryAddress};
    use std::sync::Arc;

    const CURRENCY: &str = "EGP";

    fn money(user_id: &str, amount_minor: i64, key: Option<&str>) -> MoneyMutation {
        MoneyMutation {
            user_id: user_id.to_string(),
            amount_minor,
            transaction_type: if amount_minor > 0 {
                TransactionType::Charge
            } else {
                TransactionType::Payment
            },
            description: None,
            idempotency_key: key.map(str::to_string),
            month: "2025-03".to_string(),
        }
    }

    fn product(id: &str, price_minor: i64) -> Product {
        Product {
            id: id.to_string(),
            name_en: format!("Product {}", id),
            name_ar: format!("منتج {}", id),
            price_minor,
            category_id: None,
            image_url: None,
            is_active: true,
        }
    }

    fn new_order(user_id: &str, payment_method: PaymentMethod) -> NewOrder {
        NewOrder {
            order_id: Uuid::new_v4(),
            order_number: "ORD-20250301-ABCDEF".to_string(),
            user_id: user_id.to_string(),
            payment_method,
            delivery_address: DeliveryAddress {
                full_name: "Test".into(),
                phone: "0100".into(),
                city: "Cairo".into(),
                street: "Main".into(),
                building: None,
                notes: None,
            },
            notes: None,
            points_rate_percent: 150,
            month: "2025-03".to_string(),
            placed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_concurrent_credits_are_not_lost() {
        let store = Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        for i in 1..=50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.apply_money(&money("u1", i, None), CURRENCY).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let wallet = store.find_wallet("u1").await.unwrap().unwrap();
        assert_eq!(wallet.balance_minor, (1..=50).sum::<i64>());
        assert_eq!(store.list_transactions("u1", 100).await.unwrap().len(), 50);
        assert_eq!(store.transactions_sum("u1").await.unwrap(), wallet.balance_minor);
    }

    #[tokio::test]
    async fn test_idempotency_key_replays_original() {
        let store = InMemoryStore::new();
        let first = store
            .apply_money(&money("u1", 500, Some("topup-1")), CURRENCY)
            .await
            .unwrap();
        let second = store
            .apply_money(&money("u1", 500, Some("topup-1")), CURRENCY)
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.transaction.id, first.transaction.id);
        assert_eq!(second.wallet.balance_minor, 500);
    }

    #[tokio::test]
    async fn test_debit_without_funds_changes_nothing() {
        let store = InMemoryStore::new();
        store.apply_money(&money("u1", 300, None), CURRENCY).await.unwrap();

        let err = store
            .apply_money(&money("u1", -500, None), CURRENCY)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InsufficientFunds {
                available: 300,
                required: 500
            }
        ));
        assert_eq!(store.list_transactions("u1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_reward_once_per_day() {
        let store = InMemoryStore::new();
        let claim = RewardClaim {
            user_id: "u1".to_string(),
            kind: RewardKind::DailyGame,
            claim_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            points: 50,
            month: "2025-03".to_string(),
        };

        assert!(matches!(
            store.claim_reward(&claim, CURRENCY).await.unwrap(),
            ClaimOutcome::Awarded(_)
        ));
        assert!(matches!(
            store.claim_reward(&claim, CURRENCY).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        ));

        let wallet = store.find_wallet("u1").await.unwrap().unwrap();
        assert_eq!(wallet.points_balance, 50);
        let stats = store.monthly_stats("u1", "2025-03").await.unwrap().unwrap();
        assert_eq!(stats.points_earned, 50);
    }

    #[tokio::test]
    async fn test_wallet_order_without_funds_leaves_no_order() {
        let store = InMemoryStore::new();
        store.upsert_product(&product("p1", 10_000)).await.unwrap();
        store.add_to_cart("u1", "p1", 1, Utc::now()).await.unwrap();
        store.apply_money(&money("u1", 5_000, None), CURRENCY).await.unwrap();

        let order = new_order("u1", PaymentMethod::Wallet);
        let err = store.place_order(&order, CURRENCY).await.unwrap_err();

        assert!(matches!(err, StoreError::InsufficientFunds { .. }));
        assert!(store.find_order(order.order_id).await.unwrap().is_none());
        assert_eq!(store.list_cart("u1").await.unwrap().len(), 1);
        assert!(store.fetch_due(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_place_order_enqueues_side_effects() {
        let store = InMemoryStore::new();
        store.upsert_product(&product("p1", 2_500)).await.unwrap();
        store.add_to_cart("u1", "p1", 4, Utc::now()).await.unwrap();

        let order = store
            .place_order(&new_order("u1", PaymentMethod::CashOnDelivery), CURRENCY)
            .await
            .unwrap();

        assert_eq!(order.total_minor, 10_000);
        assert_eq!(order.points_awarded, 150);
        assert!(store.list_cart("u1").await.unwrap().is_empty());

        let due = store.fetch_due(Utc::now(), 10).await.unwrap();
        let types: Vec<&str> = due.iter().map(|r| r.event_type.as_str()).collect();
        assert_eq!(types, vec!["order.points_award", "order.confirmation_email"]);
    }

    #[tokio::test]
    async fn test_notification_reads_are_per_user() {
        let store = InMemoryStore::new();
        let broadcast = Notification {
            id: Uuid::new_v4(),
            title: "Sale".into(),
            body: "20% off".into(),
            audience: Audience::All,
            created_at: Utc::now(),
        };
        store.insert_notification(&broadcast).await.unwrap();

        assert!(store
            .mark_notification_read(broadcast.id, "u1", Utc::now())
            .await
            .unwrap());
        assert!(!store
            .mark_notification_read(broadcast.id, "u1", Utc::now())
            .await
            .unwrap());

        assert_eq!(store.unread_count("u1").await.unwrap(), 0);
        assert_eq!(store.unread_count("u2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_oversized_price_is_rejected_and_store_stays_usable() {
        let store = InMemoryStore::new();

        let err = store
            .upsert_product(&product("huge", i64::MAX / 2))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AmountOutOfRange(_)));
        assert!(store.find_product("huge").await.unwrap().is_none());

        store
            .upsert_product(&product("gold", Product::MAX_PRICE_MINOR))
            .await
            .unwrap();
        store
            .add_to_cart("u1", "gold", MAX_LINE_QUANTITY, Utc::now())
            .await
            .unwrap();

        let order = store
            .place_order(&new_order("u1", PaymentMethod::CashOnDelivery), CURRENCY)
            .await
            .unwrap();
        assert_eq!(
            order.total_minor,
            Product::MAX_PRICE_MINOR * i64::from(MAX_LINE_QUANTITY)
        );
        assert_eq!(order.points_awarded, points_for_total(order.total_minor, 150));
    }
}
