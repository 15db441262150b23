//! Wallet accessor and balance/points mutators
//!
//! All arithmetic happens inside the store under a row lock; this layer
//! validates requests, picks the ledger month and logs the outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{valid_user_id, LedgerPolicy};
use crate::models::{
    MoneyMutation, MoneyOutcome, MonthlyStats, PointsEntry, PointsMutation, PointsOutcome,
    TransactionType, Wallet, WalletTransaction,
};
use crate::store::{LedgerStore, StoreError};

/// Errors that can occur during ledger operations
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Invalid user id")]
    InvalidUser,

    #[error("Amount must not be zero")]
    ZeroAmount,

    #[error("A {transaction_type} cannot carry amount {amount_minor}")]
    InvalidSign {
        transaction_type: TransactionType,
        amount_minor: i64,
    },

    #[error("Reason is required")]
    MissingReason,

    #[error("Insufficient balance: available {available}, required {required}")]
    InsufficientBalance { available: i64, required: i64 },

    #[error("Insufficient points: available {available}, required {required}")]
    InsufficientPoints { available: i64, required: i64 },

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientFunds {
                available,
                required,
            } => LedgerError::InsufficientBalance {
                available,
                required,
            },
            StoreError::InsufficientPoints {
                available,
                required,
            } => LedgerError::InsufficientPoints {
                available,
                required,
            },
            other => LedgerError::Store(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AddMoney {
    pub user_id: String,
    pub amount_minor: i64,
    pub transaction_type: TransactionType,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AddPoints {
    pub user_id: String,
    pub delta: i64,
    pub reason: String,
    pub idempotency_key: Option<String>,
}

/// Sum of the transaction log compared with the stored balance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reconciliation {
    pub user_id: String,
    pub balance_minor: i64,
    pub transactions_sum_minor: i64,
    pub consistent: bool,
}

fn check_user(user_id: &str) -> Result<(), LedgerError> {
    if valid_user_id(user_id) {
        Ok(())
    } else {
        Err(LedgerError::InvalidUser)
    }
}

/// Return the user's wallet, creating an empty one on first access
pub async fn get_wallet<S: LedgerStore + ?Sized>(
    store: &S,
    policy: &LedgerPolicy,
    user_id: &str,
) -> Result<Wallet, LedgerError> {
    check_user(user_id)?;
    Ok(store.ensure_wallet(user_id, &policy.currency).await?)
}

/// Read-only lookup; never creates a wallet
pub async fn peek_wallet<S: LedgerStore + ?Sized>(
    store: &S,
    user_id: &str,
) -> Result<Option<Wallet>, LedgerError> {
    check_user(user_id)?;
    Ok(store.find_wallet(user_id).await?)
}

pub async fn add_money<S: LedgerStore + ?Sized>(
    store: &S,
    policy: &LedgerPolicy,
    request: AddMoney,
    now: DateTime<Utc>,
) -> Result<MoneyOutcome, LedgerError> {
    check_user(&request.user_id)?;
    if request.amount_minor == 0 {
        return Err(LedgerError::ZeroAmount);
    }
    if !request.transaction_type.accepts_amount(request.amount_minor) {
        return Err(LedgerError::InvalidSign {
            transaction_type: request.transaction_type,
            amount_minor: request.amount_minor,
        });
    }

    let mutation = MoneyMutation {
        user_id: request.user_id,
        amount_minor: request.amount_minor,
        transaction_type: request.transaction_type,
        description: request.description.filter(|d| !d.trim().is_empty()),
        idempotency_key: request.idempotency_key.filter(|k| !k.trim().is_empty()),
        month: policy.calendar.month_key(now),
    };

    let outcome = store.apply_money(&mutation, &policy.currency).await?;

    if outcome.replayed {
        tracing::info!(
            user_id = %mutation.user_id,
            transaction_id = %outcome.transaction.id,
            "Money mutation replayed from idempotency key"
        );
    } else {
        tracing::info!(
            user_id = %mutation.user_id,
            transaction_type = %mutation.transaction_type,
            amount_minor = mutation.amount_minor,
            balance_minor = outcome.wallet.balance_minor,
            "Money mutation applied"
        );
    }

    Ok(outcome)
}

pub async fn add_points<S: LedgerStore + ?Sized>(
    store: &S,
    policy: &LedgerPolicy,
    request: AddPoints,
    now: DateTime<Utc>,
) -> Result<PointsOutcome, LedgerError> {
    check_user(&request.user_id)?;
    if request.delta == 0 {
        return Err(LedgerError::ZeroAmount);
    }
    if request.reason.trim().is_empty() {
        return Err(LedgerError::MissingReason);
    }

    let mutation = PointsMutation {
        user_id: request.user_id,
        delta: request.delta,
        reason: request.reason.trim().to_string(),
        idempotency_key: request.idempotency_key.filter(|k| !k.trim().is_empty()),
        month: policy.calendar.month_key(now),
    };

    let outcome = store.apply_points(&mutation, &policy.currency).await?;

    tracing::info!(
        user_id = %mutation.user_id,
        delta = mutation.delta,
        points_balance = outcome.wallet.points_balance,
        replayed = outcome.replayed,
        reason = %mutation.reason,
        "Points mutation applied"
    );

    Ok(outcome)
}

pub async fn monthly_stats<S: LedgerStore + ?Sized>(
    store: &S,
    user_id: &str,
    month: &str,
) -> Result<Option<MonthlyStats>, LedgerError> {
    check_user(user_id)?;
    Ok(store.monthly_stats(user_id, month).await?)
}

pub async fn transactions<S: LedgerStore + ?Sized>(
    store: &S,
    user_id: &str,
    limit: i64,
) -> Result<Vec<WalletTransaction>, LedgerError> {
    check_user(user_id)?;
    Ok(store.list_transactions(user_id, limit).await?)
}

pub async fn points_history<S: LedgerStore + ?Sized>(
    store: &S,
    user_id: &str,
    limit: i64,
) -> Result<Vec<PointsEntry>, LedgerError> {
    check_user(user_id)?;
    Ok(store.list_points_entries(user_id, limit).await?)
}

/// Verify that the transaction log sums to the stored balance
pub async fn reconcile<S: LedgerStore + ?Sized>(
    store: &S,
    user_id: &str,
) -> Result<Reconciliation, LedgerError> {
    check_user(user_id)?;
    let balance_minor = store
        .find_wallet(user_id)
        .await?
        .map(|w| w.balance_minor)
        .unwrap_or(0);
    let transactions_sum_minor = store.transactions_sum(user_id).await?;

    let consistent = balance_minor == transactions_sum_minor;
    if !consistent {
        tracing::warn!(
            user_id = %user_id,
            balance_minor,
            transactions_sum_minor,
            "Wallet balance does not match its transaction log"
        );
    }

    Ok(Reconciliation {
        user_id: user_id.to_string(),
        balance_minor,
        transactions_sum_minor,
        consistent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 10, 0, 0).unwrap()
    }

    fn charge(user_id: &str, amount_minor: i64) -> AddMoney {
        AddMoney {
            user_id: user_id.to_string(),
            amount_minor,
            transaction_type: TransactionType::Charge,
            description: Some("Top-up".to_string()),
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn test_get_wallet_creates_zero_wallet() {
        let store = InMemoryStore::new();
        let policy = LedgerPolicy::default();

        assert!(peek_wallet(&store, "u1").await.unwrap().is_none());
        let wallet = get_wallet(&store, &policy, "u1").await.unwrap();
        assert_eq!(wallet.balance_minor, 0);
        assert_eq!(wallet.points_balance, 0);
        assert_eq!(wallet.currency, "EGP");

        let again = get_wallet(&store, &policy, "u1").await.unwrap();
        assert_eq!(again.id, wallet.id);
    }

    #[tokio::test]
    async fn test_rejects_invalid_requests() {
        let store = InMemoryStore::new();
        let policy = LedgerPolicy::default();

        assert!(matches!(
            add_money(&store, &policy, charge("u1", 0), at()).await,
            Err(LedgerError::ZeroAmount)
        ));
        assert!(matches!(
            add_money(&store, &policy, charge("u1", -100), at()).await,
            Err(LedgerError::InvalidSign { .. })
        ));
        assert!(matches!(
            add_money(&store, &policy, charge("all", 100), at()).await,
            Err(LedgerError::InvalidUser)
        ));
        assert!(matches!(
            get_wallet(&store, &policy, "  ").await,
            Err(LedgerError::InvalidUser)
        ));
    }

    #[tokio::test]
    async fn test_credit_counts_as_monthly_profit() {
        let store = InMemoryStore::new();
        let policy = LedgerPolicy::default();

        add_money(&store, &policy, charge("u1", 15_000), at()).await.unwrap();
        let payment = AddMoney {
            transaction_type: TransactionType::Payment,
            ..charge("u1", -5_000)
        };
        add_money(&store, &policy, payment, at()).await.unwrap();

        let stats = monthly_stats(&store, "u1", "2025-03").await.unwrap().unwrap();
        assert_eq!(stats.profit_earned_minor, 15_000);

        let report = reconcile(&store, "u1").await.unwrap();
        assert_eq!(report.balance_minor, 10_000);
        assert!(report.consistent);
    }

    #[tokio::test]
    async fn test_overdraft_maps_to_insufficient_balance() {
        let store = InMemoryStore::new();
        let policy = LedgerPolicy::default();

        let payment = AddMoney {
            transaction_type: TransactionType::Payment,
            ..charge("u1", -1)
        };
        let err = add_money(&store, &policy, payment, at()).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientBalance {
                available: 0,
                required: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_points_redemption_cannot_go_negative() {
        let store = InMemoryStore::new();
        let policy = LedgerPolicy::default();

        let award = AddPoints {
            user_id: "u1".to_string(),
            delta: 40,
            reason: "promo".to_string(),
            idempotency_key: None,
        };
        add_points(&store, &policy, award.clone(), at()).await.unwrap();

        let redeem = AddPoints {
            delta: -60,
            reason: "redeem".to_string(),
            ..award
        };
        let err = add_points(&store, &policy, redeem, at()).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientPoints { .. }));

        let stats = monthly_stats(&store, "u1", "2025-03").await.unwrap().unwrap();
        assert_eq!(stats.points_earned, 40);
        assert_eq!(points_history(&store, "u1", 10).await.unwrap().len(), 1);
    }
}
