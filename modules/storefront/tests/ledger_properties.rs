//! Ledger acceptance properties
//!
//! Each scenario runs against the in-memory store and, when `DATABASE_URL`
//! points at a scratch database, against Postgres (`cargo test -- --ignored`).

mod common;

use chrono::Duration;
use serial_test::serial;

use common::{unique_user, TestApp};
use storefront_rs::clock::Clock;
use storefront_rs::models::{DeliveryAddress, PaymentMethod, TransactionType};
use storefront_rs::services::checkout_service::{self, CheckoutError, PlaceOrder};
use storefront_rs::services::reward_service::{self, RewardError};
use storefront_rs::services::wallet_service::{self, AddMoney, AddPoints};

fn address() -> DeliveryAddress {
    DeliveryAddress {
        full_name: "Hoda".into(),
        phone: "01222222222".into(),
        city: "Alexandria".into(),
        street: "Corniche".into(),
        building: None,
        notes: None,
    }
}

async fn charge(app: &TestApp, user: &str, amount_minor: i64) {
    wallet_service::add_money(
        app.store.as_ref(),
        &app.state.policy,
        AddMoney {
            user_id: user.to_string(),
            amount_minor,
            transaction_type: TransactionType::Charge,
            description: Some("Top-up".into()),
            idempotency_key: None,
        },
        app.clock.now(),
    )
    .await
    .unwrap();
}

// ============================================================================
// SCENARIOS
// ============================================================================

/// Concurrent credits all land, each with exactly one matching transaction
async fn concurrent_money_is_not_lost(app: &TestApp) {
    let user = unique_user();
    let amounts: Vec<i64> = (1..=20).map(|i| i * 100).collect();

    let mut handles = Vec::new();
    for amount in amounts.clone() {
        let store = app.store.clone();
        let policy = app.state.policy.clone();
        let user = user.clone();
        let now = app.clock.now();
        handles.push(tokio::spawn(async move {
            wallet_service::add_money(
                store.as_ref(),
                &policy,
                AddMoney {
                    user_id: user,
                    amount_minor: amount,
                    transaction_type: TransactionType::Charge,
                    description: None,
                    idempotency_key: None,
                },
                now,
            )
            .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let expected: i64 = amounts.iter().sum();
    let wallet = wallet_service::get_wallet(app.store.as_ref(), &app.state.policy, &user)
        .await
        .unwrap();
    assert_eq!(wallet.balance_minor, expected);

    let transactions = wallet_service::transactions(app.store.as_ref(), &user, 100)
        .await
        .unwrap();
    assert_eq!(transactions.len(), amounts.len());
    let mut recorded: Vec<i64> = transactions.iter().map(|t| t.amount_minor).collect();
    recorded.sort_unstable();
    assert_eq!(recorded, amounts);

    let report = wallet_service::reconcile(app.store.as_ref(), &user)
        .await
        .unwrap();
    assert!(report.consistent);
}

async fn concurrent_points_are_not_lost(app: &TestApp) {
    let user = unique_user();

    let mut handles = Vec::new();
    for delta in 1..=25i64 {
        let store = app.store.clone();
        let policy = app.state.policy.clone();
        let user = user.clone();
        let now = app.clock.now();
        handles.push(tokio::spawn(async move {
            wallet_service::add_points(
                store.as_ref(),
                &policy,
                AddPoints {
                    user_id: user,
                    delta,
                    reason: "Add to cart bonus".into(),
                    idempotency_key: None,
                },
                now,
            )
            .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let wallet = wallet_service::get_wallet(app.store.as_ref(), &app.state.policy, &user)
        .await
        .unwrap();
    assert_eq!(wallet.points_balance, (1..=25).sum::<i64>());

    let history = wallet_service::points_history(app.store.as_ref(), &user, 100)
        .await
        .unwrap();
    assert_eq!(history.len(), 25);
}

/// Daily rewards are enforced by the server, once per ledger day
async fn daily_rewards_award_once(app: &TestApp) {
    let user = unique_user();
    let store = app.store.as_ref();
    let policy = &app.state.policy;

    let first = reward_service::play_daily_game(store, policy, &user, 12, app.clock.now())
        .await
        .unwrap();
    assert_eq!(first.points, 12);

    let second = reward_service::play_daily_game(store, policy, &user, 30, app.clock.now()).await;
    assert!(matches!(second, Err(RewardError::AlreadyClaimed { .. })));

    let ai_first = reward_service::reward_ai_interaction(store, policy, &user, app.clock.now())
        .await
        .unwrap();
    assert!(ai_first.is_some());
    let ai_second = reward_service::reward_ai_interaction(store, policy, &user, app.clock.now())
        .await
        .unwrap();
    assert!(ai_second.is_none());

    let wallet = wallet_service::get_wallet(store, policy, &user).await.unwrap();
    assert_eq!(wallet.points_balance, 12 + policy.ai_daily_reward_points);

    // Next ledger day opens a new claim
    let tomorrow = app.clock.now() + Duration::days(1);
    reward_service::play_daily_game(store, policy, &user, 5, tomorrow)
        .await
        .unwrap();
}

async fn wallet_order_without_funds_is_rejected(app: &TestApp) {
    let user = unique_user();
    app.seed_product("prop-oil", 8_000).await;
    charge(app, &user, 5_000).await;

    checkout_service::add_to_cart(app.store.as_ref(), &user, "prop-oil", 1, app.clock.now())
        .await
        .unwrap();

    let result = checkout_service::place_order(
        app.store.as_ref(),
        &app.state.policy,
        PlaceOrder {
            user_id: user.clone(),
            payment_method: PaymentMethod::Wallet,
            delivery_address: Some(address()),
            notes: None,
        },
        app.clock.now(),
    )
    .await;

    assert!(matches!(
        result,
        Err(CheckoutError::InsufficientBalance {
            available: 5_000,
            required: 8_000
        })
    ));

    let orders = checkout_service::list_orders(app.store.as_ref(), &user, 10)
        .await
        .unwrap();
    assert!(orders.is_empty());

    let wallet = wallet_service::get_wallet(app.store.as_ref(), &app.state.policy, &user)
        .await
        .unwrap();
    assert_eq!(wallet.balance_minor, 5_000);

    let cart = checkout_service::cart_summary(app.store.as_ref(), &user)
        .await
        .unwrap();
    assert_eq!(cart.item_count, 1);
}

/// Sign up, top up 150 EGP, buy 100 EGP by wallet, earn 150 points
async fn checkout_end_to_end(app: &TestApp) {
    let user = unique_user();
    let store = app.store.as_ref();
    let policy = &app.state.policy;

    let fresh = wallet_service::get_wallet(store, policy, &user).await.unwrap();
    assert_eq!((fresh.balance_minor, fresh.points_balance), (0, 0));

    app.seed_product("prop-dates", 5_000).await;
    charge(app, &user, 15_000).await;
    checkout_service::add_to_cart(store, &user, "prop-dates", 2, app.clock.now())
        .await
        .unwrap();

    let order = checkout_service::place_order(
        store,
        policy,
        PlaceOrder {
            user_id: user.clone(),
            payment_method: PaymentMethod::Wallet,
            delivery_address: Some(address()),
            notes: Some("Ring twice".into()),
        },
        app.clock.now(),
    )
    .await
    .unwrap();
    assert_eq!(order.total_minor, 10_000);
    assert_eq!(order.points_awarded, 150);

    let after_order = wallet_service::get_wallet(store, policy, &user).await.unwrap();
    assert_eq!(after_order.balance_minor, 5_000);

    // Points arrive through the outbox
    let dispatcher = app.dispatcher();
    let report = dispatcher.run_once().await.unwrap();
    assert!(report.processed >= 2);

    let wallet = wallet_service::get_wallet(store, policy, &user).await.unwrap();
    assert_eq!(wallet.points_balance, 150);

    let month = policy.calendar.month_key(app.clock.now());
    let stats = wallet_service::monthly_stats(store, &user, &month)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.points_earned, 150);

    // Re-running the dispatcher never double-awards
    dispatcher.run_once().await.unwrap();
    let wallet = wallet_service::get_wallet(store, policy, &user).await.unwrap();
    assert_eq!(wallet.points_balance, 150);
}

async fn daily_game_full_catch(app: &TestApp) {
    let user = unique_user();
    let store = app.store.as_ref();
    let policy = &app.state.policy;

    let grant = reward_service::play_daily_game(store, policy, &user, 50, app.clock.now())
        .await
        .unwrap();
    assert_eq!(grant.points, 50);
    assert_eq!(grant.wallet.points_balance, 50);

    let replay = reward_service::play_daily_game(store, policy, &user, 50, app.clock.now()).await;
    assert!(matches!(replay, Err(RewardError::AlreadyClaimed { .. })));

    let wallet = wallet_service::get_wallet(store, policy, &user).await.unwrap();
    assert_eq!(wallet.points_balance, 50);

    let status = reward_service::daily_game_status(store, policy, &user, app.clock.now())
        .await
        .unwrap();
    assert!(status.played);

    // Reported catches above the cap are clamped
    let other = unique_user();
    let capped = reward_service::play_daily_game(store, policy, &other, 80, app.clock.now())
        .await
        .unwrap();
    assert_eq!(capped.points, 50);
}

// ============================================================================
// IN-MEMORY
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_money_in_memory() {
    concurrent_money_is_not_lost(&TestApp::in_memory()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_points_in_memory() {
    concurrent_points_are_not_lost(&TestApp::in_memory()).await;
}

#[tokio::test]
async fn test_daily_rewards_in_memory() {
    daily_rewards_award_once(&TestApp::in_memory()).await;
}

#[tokio::test]
async fn test_wallet_order_without_funds_in_memory() {
    wallet_order_without_funds_is_rejected(&TestApp::in_memory()).await;
}

#[tokio::test]
async fn test_checkout_end_to_end_in_memory() {
    checkout_end_to_end(&TestApp::in_memory()).await;
}

#[tokio::test]
async fn test_daily_game_full_catch_in_memory() {
    daily_game_full_catch(&TestApp::in_memory()).await;
}

// ============================================================================
// POSTGRES
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
#[serial]
async fn test_concurrent_money_postgres() {
    let (app, pool) = common::pg_app().await;
    concurrent_money_is_not_lost(&app).await;
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
#[serial]
async fn test_concurrent_points_postgres() {
    let (app, pool) = common::pg_app().await;
    concurrent_points_are_not_lost(&app).await;
    pool.close().await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_daily_rewards_postgres() {
    let (app, pool) = common::pg_app().await;
    daily_rewards_award_once(&app).await;
    pool.close().await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_wallet_order_without_funds_postgres() {
    let (app, pool) = common::pg_app().await;
    wallet_order_without_funds_is_rejected(&app).await;
    pool.close().await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_checkout_end_to_end_postgres() {
    let (app, pool) = common::pg_app().await;
    checkout_end_to_end(&app).await;
    pool.close().await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_daily_game_full_catch_postgres() {
    let (app, pool) = common::pg_app().await;
    daily_game_full_catch(&app).await;
    pool.close().await;
}
