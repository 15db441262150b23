//! HTTP surface
//!
//! Handlers stay thin: parse the request, call one service function with
//! `state.clock.now()`, map the error through [`error::ApiError`].

pub mod admin;
pub mod cart;
pub mod chat;
pub mod error;
pub mod metrics;
pub mod notifications;
pub mod orders;
pub mod rewards;
pub mod wallet;

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::health;
use crate::state::AppState;

pub use error::{ApiError, ErrorResponse};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

/// `?limit=` on list endpoints
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

impl ListQuery {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/metrics", get(metrics::metrics))
        // Wallet
        .route("/api/wallets/{user_id}", get(wallet::get_wallet))
        .route("/api/wallets/{user_id}/money", post(wallet::add_money))
        .route("/api/wallets/{user_id}/points", post(wallet::add_points))
        .route(
            "/api/wallets/{user_id}/transactions",
            get(wallet::list_transactions),
        )
        .route(
            "/api/wallets/{user_id}/points/history",
            get(wallet::points_history),
        )
        .route("/api/wallets/{user_id}/stats", get(wallet::monthly_stats))
        .route("/api/wallets/{user_id}/reconcile", get(wallet::reconcile))
        // Rewards
        .route(
            "/api/rewards/{user_id}/daily-game",
            get(rewards::daily_game_status).post(rewards::play_daily_game),
        )
        // Cart
        .route("/api/cart/{user_id}", get(cart::get_cart))
        .route("/api/cart/{user_id}/items", post(cart::add_item))
        .route(
            "/api/cart/{user_id}/items/{product_id}",
            put(cart::set_quantity).delete(cart::remove_item),
        )
        // Orders
        .route("/api/orders", post(orders::place_order))
        .route("/api/orders/{order_id}", get(orders::get_order))
        .route("/api/users/{user_id}/orders", get(orders::list_orders))
        // Catalog
        .route("/api/products/{product_id}", get(admin::get_product))
        // Notifications
        .route(
            "/api/notifications/{user_id}",
            get(notifications::list_notifications),
        )
        .route(
            "/api/notifications/{user_id}/unread-count",
            get(notifications::unread_count),
        )
        .route(
            "/api/notifications/{user_id}/stream",
            get(notifications::stream),
        )
        .route(
            "/api/notifications/{user_id}/{notification_id}/read",
            post(notifications::mark_read),
        )
        // Admin
        .route(
            "/api/admin/orders/{order_id}/status",
            post(admin::advance_order),
        )
        .route("/api/admin/products/import", post(admin::import_products))
        .route(
            "/api/admin/notifications",
            post(admin::create_notification),
        )
        .route(
            "/api/admin/notifications/{notification_id}",
            delete(admin::delete_notification),
        )
        // Assistant
        .route("/api/chat", post(chat::chat))
        .layer(middleware::from_fn(error::localize_errors))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
