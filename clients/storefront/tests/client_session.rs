//! Client and session tests against an in-process storefront service

use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use uuid::Uuid;

use storefront_client::{ClientError, SessionController, StorefrontClient};
use storefront_rs::clock::SystemClock;
use storefront_rs::config::ChatConfig;
use storefront_rs::events::payloads::NotificationEventKind;
use storefront_rs::events::InMemoryBus;
use storefront_rs::metrics::Metrics;
use storefront_rs::models::{DeliveryAddress, OrderStatus, PaymentMethod, TransactionType};
use storefront_rs::routes::orders::PlaceOrderRequest;
use storefront_rs::routes::wallet::AddMoneyRequest;
use storefront_rs::services::chat_service::{ChatAssistant, ChatMessage, ChatRequest, ChatRole};
use storefront_rs::services::notification_service::CreateNotification;
use storefront_rs::services::LedgerPolicy;
use storefront_rs::store::InMemoryStore;
use storefront_rs::{build_router, AppState};

/// Serve a fresh in-memory service on an ephemeral port
async fn spawn_service() -> StorefrontClient {
    // Chat providers have no keys and point at a closed port, so every reply fails over and errors
    let chat = ChatAssistant::from_config(&ChatConfig {
        primary_url: "http://127.0.0.1:9/v1/chat/completions".to_string(),
        primary_model: "test".to_string(),
        primary_api_key: None,
        fallback_url: "http://127.0.0.1:9/prompt".to_string(),
        fallback_api_key: None,
        timeout_secs: 2,
        history_window: 10,
    })
    .unwrap();

    let state = AppState {
        store: Arc::new(InMemoryStore::new()),
        bus: Arc::new(InMemoryBus::new()),
        clock: Arc::new(SystemClock),
        policy: LedgerPolicy::default(),
        chat: Arc::new(chat),
        metrics: Metrics::new().unwrap(),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });

    StorefrontClient::new(&format!("http://{}", addr)).unwrap()
}

fn unique_user() -> String {
    format!("user-{}", Uuid::new_v4())
}

fn top_up(amount_minor: i64) -> AddMoneyRequest {
    AddMoneyRequest {
        amount_minor,
        transaction_type: TransactionType::Charge,
        description: Some("Top-up".to_string()),
        idempotency_key: None,
    }
}

#[tokio::test]
async fn test_wallet_calls_and_idempotent_replay() {
    let client = spawn_service().await;
    let user = unique_user();

    let health = client.health().await.unwrap();
    assert_eq!(health["status"], "healthy");

    let wallet = client.wallet(&user).await.unwrap();
    assert_eq!(wallet.balance_minor, 0);

    let first = client
        .add_money(&user, &top_up(10_000), Some("topup-1"))
        .await
        .unwrap();
    let replay = client
        .add_money(&user, &top_up(10_000), Some("topup-1"))
        .await
        .unwrap();
    assert!(!first.replayed);
    assert!(replay.replayed);
    assert_eq!(replay.transaction.id, first.transaction.id);
    assert_eq!(client.wallet(&user).await.unwrap().balance_minor, 10_000);

    let transactions = client.transactions(&user, Some(10)).await.unwrap();
    assert_eq!(transactions.len(), 1);

    let reconciliation = client.reconcile(&user).await.unwrap();
    assert!(reconciliation.consistent);
}

#[tokio::test]
async fn test_api_errors_carry_code_and_locale() {
    let client = spawn_service().await;
    let user = unique_user();

    let spend = AddMoneyRequest {
        amount_minor: -500,
        transaction_type: TransactionType::Payment,
        description: None,
        idempotency_key: None,
    };

    let err = client.add_money(&user, &spend, None).await.unwrap_err();
    assert_eq!(err.code(), Some("insufficient_balance"));
    assert!(err.is_client_error());

    let arabic = client.clone().with_locale("ar");
    match arabic.add_money(&user, &spend, None).await.unwrap_err() {
        ClientError::Api {
            status, message, ..
        } => {
            assert_eq!(status, 409);
            assert_eq!(message, "رصيد المحفظة غير كافٍ");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let missing = client.product("no-such-product").await.unwrap_err();
    assert_eq!(missing.code(), Some("not_found"));
}

#[tokio::test]
async fn test_catalog_cart_and_wallet_order() {
    let client = spawn_service().await;
    let user = unique_user();

    let report = client
        .import_products(&json!([
            {"id": "milk", "nameEn": "Milk 1L", "nameAr": "لبن", "price": "32.50"},
            {"id": "bread", "name": "Bread", "price_minor": 500}
        ]))
        .await
        .unwrap();
    assert_eq!(report.imported, 2);
    assert!(report.rejected.is_empty());

    client.add_money(&user, &top_up(15_000), None).await.unwrap();

    let line = client.add_to_cart(&user, "milk", 2).await.unwrap();
    assert_eq!(line.quantity, 2);
    client.add_to_cart(&user, "bread", 1).await.unwrap();
    assert_eq!(client.set_cart_quantity(&user, "bread", 0).await.unwrap(), None);

    let cart = client.cart(&user).await.unwrap();
    assert_eq!(cart.items.len(), 1);
    assert_eq!(cart.total_minor, 6_500);

    let order = client
        .place_order(&PlaceOrderRequest {
            user_id: user.clone(),
            payment_method: PaymentMethod::Wallet,
            delivery_address: Some(DeliveryAddress {
                full_name: "Yasmin".to_string(),
                phone: "01099999999".to_string(),
                city: "Mansoura".to_string(),
                street: "El Gomhoreya".to_string(),
                building: None,
                notes: None,
            }),
            notes: None,
        })
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.total_minor, 6_500);
    assert_eq!(client.wallet(&user).await.unwrap().balance_minor, 8_500);
    assert!(client.cart(&user).await.unwrap().items.is_empty());

    let advanced = client
        .advance_order(order.id, OrderStatus::Preparing)
        .await
        .unwrap();
    assert_eq!(advanced.status, OrderStatus::Preparing);
    assert_eq!(client.order(order.id).await.unwrap().status, OrderStatus::Preparing);
    assert_eq!(client.user_orders(&user, None).await.unwrap().len(), 1);

    let err = client
        .advance_order(order.id, OrderStatus::Delivered)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("invalid_transition"));
}

#[tokio::test]
async fn test_session_confirms_and_rolls_back_optimistic_points() {
    let client = spawn_service().await;
    let user = unique_user();
    let session = SessionController::new();

    assert!(matches!(
        session.apply_points(&client, 10, "cart_add", None).await,
        Err(ClientError::NoSession)
    ));

    session.start(&user, &client.wallet(&user).await.unwrap());
    let mut changes = session.subscribe();

    let response = session
        .apply_points(&client, 25, "cart_add", Some("cart-add-1"))
        .await
        .unwrap();
    assert_eq!(response.wallet.points_balance, 25);
    assert_eq!(session.displayed_points(), 25);
    assert!(session.snapshot().pending.is_empty());
    assert!(changes.has_changed().unwrap());

    let err = session
        .apply_points(&client, -100, "redeem", None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("insufficient_points"));
    assert_eq!(session.displayed_points(), 25);
    assert!(session.snapshot().pending.is_empty());

    // A pending delta that never reaches the server disappears on resync
    session.record(40).unwrap();
    assert_eq!(session.displayed_points(), 65);
    session.resync(&client.wallet(&user).await.unwrap());
    assert_eq!(session.displayed_points(), 25);

    let stats = client.monthly_stats(&user, None).await.unwrap();
    assert_eq!(stats.points_earned, 25);
    let history = client.points_history(&user, None).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_daily_game_through_client() {
    let client = spawn_service().await;
    let user = unique_user();

    assert!(!client.daily_game_status(&user).await.unwrap().played);
    let grant = client.play_daily_game(&user, 12).await.unwrap();
    assert_eq!(grant.points, 12);
    assert!(client.daily_game_status(&user).await.unwrap().played);

    let err = client.play_daily_game(&user, 12).await.unwrap_err();
    assert_eq!(err.code(), Some("already_claimed"));
}

#[tokio::test]
async fn test_notification_inbox_and_stream() {
    let client = spawn_service().await;
    let user = unique_user();

    let mut stream = client.notification_stream(&user).await.unwrap();

    let created = client
        .create_notification(&CreateNotification {
            title: "Weekend offer".to_string(),
            body: "20% off fruit".to_string(),
            audience: user.clone(),
        })
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, NotificationEventKind::Created);
    assert_eq!(event.notification.id, created.id);

    assert_eq!(client.unread_count(&user).await.unwrap().unread, 1);
    let receipt = client
        .mark_notification_read(&user, created.id)
        .await
        .unwrap();
    assert!(receipt.changed);

    let inbox = client.notifications(&user, None).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert!(inbox[0].read);

    client.delete_notification(created.id).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, NotificationEventKind::Deleted);
    assert!(client.notifications(&user, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_chat_errors_map_to_client_errors() {
    let client = spawn_service().await;

    let empty = ChatRequest {
        user_id: None,
        locale: "en".to_string(),
        messages: vec![],
        products: vec![],
    };
    let err = client.chat(&empty).await.unwrap_err();
    assert_eq!(err.code(), Some("validation_error"));

    let request = ChatRequest {
        messages: vec![ChatMessage {
            role: ChatRole::User,
            content: "Any fruit deals?".to_string(),
        }],
        ..empty
    };
    let err = client.chat(&request).await.unwrap_err();
    assert_eq!(err.code(), Some("chat_unavailable"));
    assert!(err.is_server_error());
}
