//! Wallet API routes
//!
//! Balances, points and their append-only history. Mutations accept an
//! `Idempotency-Key` header; a retried request with the same key returns
//! the original result instead of moving money twice.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{ApiError, ListQuery};
use crate::clock::parse_month_key;
use crate::models::{PointsEntry, TransactionType, Wallet, WalletTransaction};
use crate::services::wallet_service::{self, AddMoney, AddPoints, LedgerError, Reconciliation};
use crate::state::AppState;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddMoneyRequest {
    pub amount_minor: i64,
    pub transaction_type: TransactionType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddPointsRequest {
    pub delta: i64,
    pub reason: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoneyResponse {
    pub wallet: Wallet,
    pub transaction: WalletTransaction,
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointsResponse {
    pub wallet: Wallet,
    pub entry: PointsEntry,
    pub replayed: bool,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    /// `YYYY-MM`; defaults to the current ledger month
    pub month: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub user_id: String,
    pub month: String,
    pub points_earned: i64,
    pub profit_earned_minor: i64,
}

/// Header wins over the body field
fn idempotency_key(headers: &HeaderMap, body_key: Option<String>) -> Option<String> {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or(body_key)
}

fn rejection_label(err: &LedgerError) -> &'static str {
    match err {
        LedgerError::Store(_) => "error",
        _ => "rejected",
    }
}

/// GET /api/wallets/{user_id}
pub async fn get_wallet(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Wallet>, ApiError> {
    let wallet = wallet_service::get_wallet(state.store.as_ref(), &state.policy, &user_id).await?;
    Ok(Json(wallet))
}

/// POST /api/wallets/{user_id}/money
pub async fn add_money(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AddMoneyRequest>,
) -> Result<(StatusCode, Json<MoneyResponse>), ApiError> {
    let request = AddMoney {
        user_id,
        amount_minor: body.amount_minor,
        transaction_type: body.transaction_type,
        description: body.description,
        idempotency_key: idempotency_key(&headers, body.idempotency_key),
    };

    let counter = &state.metrics.ledger_mutations_total;
    match wallet_service::add_money(state.store.as_ref(), &state.policy, request, state.clock.now())
        .await
    {
        Ok(outcome) => {
            let (status, label) = if outcome.replayed {
                (StatusCode::OK, "replayed")
            } else {
                (StatusCode::CREATED, "applied")
            };
            counter.with_label_values(&["money", label]).inc();
            Ok((
                status,
                Json(MoneyResponse {
                    wallet: outcome.wallet,
                    transaction: outcome.transaction,
                    replayed: outcome.replayed,
                }),
            ))
        }
        Err(e) => {
            counter.with_label_values(&["money", rejection_label(&e)]).inc();
            Err(e.into())
        }
    }
}

/// POST /api/wallets/{user_id}/points
pub async fn add_points(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AddPointsRequest>,
) -> Result<(StatusCode, Json<PointsResponse>), ApiError> {
    let request = AddPoints {
        user_id,
        delta: body.delta,
        reason: body.reason,
        idempotency_key: idempotency_key(&headers, body.idempotency_key),
    };

    let counter = &state.metrics.ledger_mutations_total;
    match wallet_service::add_points(state.store.as_ref(), &state.policy, request, state.clock.now())
        .await
    {
        Ok(outcome) => {
            let (status, label) = if outcome.replayed {
                (StatusCode::OK, "replayed")
            } else {
                (StatusCode::CREATED, "applied")
            };
            counter.with_label_values(&["points", label]).inc();
            Ok((
                status,
                Json(PointsResponse {
                    wallet: outcome.wallet,
                    entry: outcome.entry,
                    replayed: outcome.replayed,
                }),
            ))
        }
        Err(e) => {
            counter.with_label_values(&["points", rejection_label(&e)]).inc();
            Err(e.into())
        }
    }
}

/// GET /api/wallets/{user_id}/transactions
pub async fn list_transactions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<WalletTransaction>>, ApiError> {
    let rows = wallet_service::transactions(state.store.as_ref(), &user_id, query.limit()).await?;
    Ok(Json(rows))
}

/// GET /api/wallets/{user_id}/points/history
pub async fn points_history(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<PointsEntry>>, ApiError> {
    let rows = wallet_service::points_history(state.store.as_ref(), &user_id, query.limit()).await?;
    Ok(Json(rows))
}

/// GET /api/wallets/{user_id}/stats?month=YYYY-MM
///
/// A month with no activity reports zeros rather than 404.
pub async fn monthly_stats(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    let month = match query.month.as_deref() {
        Some(raw) => parse_month_key(raw)
            .ok_or_else(|| ApiError::validation(format!("Invalid month: {}", raw)))?,
        None => state.policy.calendar.month_key(state.clock.now()),
    };

    let stats = wallet_service::monthly_stats(state.store.as_ref(), &user_id, &month).await?;
    Ok(Json(StatsResponse {
        points_earned: stats.as_ref().map(|s| s.points_earned).unwrap_or(0),
        profit_earned_minor: stats.as_ref().map(|s| s.profit_earned_minor).unwrap_or(0),
        user_id,
        month,
    }))
}

/// GET /api/wallets/{user_id}/reconcile
pub async fn reconcile(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Reconciliation>, ApiError> {
    let report = wallet_service::reconcile(state.store.as_ref(), &user_id).await?;
    Ok(Json(report))
}
