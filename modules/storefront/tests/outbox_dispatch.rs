mod common;

use async_trait::async_trait;
use chrono::Duration;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use common::{unique_user, TestApp};
use storefront_rs::clock::Clock;
use storefront_rs::config::OutboxConfig;
use storefront_rs::events::{EventBus, EventEnvelope};
use storefront_rs::models::{DeliveryAddress, NewOutboxEvent, Order, OrderStatus, PaymentMethod};
use storefront_rs::services::checkout_service::{self, PlaceOrder};
use storefront_rs::services::email::{EmailError, EmailMessage, EmailSender};
use storefront_rs::services::notification_service;
use storefront_rs::services::outbox_dispatcher::{DispatchReport, OutboxDispatcher};
use storefront_rs::services::wallet_service;
use storefront_rs::store::OutboxStore;

/// Email function that always answers 500
#[derive(Default)]
struct FailingEmail {
    calls: AtomicUsize,
}

#[async_trait]
impl EmailSender for FailingEmail {
    async fn send(&self, _message: &EmailMessage) -> Result<(), EmailError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EmailError::Rejected {
            status: 500,
            body: "mailer down".to_string(),
        })
    }
}

fn config() -> OutboxConfig {
    OutboxConfig {
        max_attempts: 3,
        initial_backoff_ms: 1_000,
        max_backoff_secs: 60,
        ..OutboxConfig::default()
    }
}

async fn place_cash_order(app: &TestApp, user: &str) -> Order {
    app.seed_product("outbox-bread", 1_500).await;
    checkout_service::add_to_cart(app.store.as_ref(), user, "outbox-bread", 2, app.clock.now())
        .await
        .unwrap();
    checkout_service::place_order(
        app.store.as_ref(),
        &app.state.policy,
        PlaceOrder {
            user_id: user.to_string(),
            payment_method: PaymentMethod::CashOnDelivery,
            delivery_address: Some(DeliveryAddress {
                full_name: "Omar".into(),
                phone: "01555555555".into(),
                city: "Cairo".into(),
                street: "Abbas El Akkad".into(),
                building: None,
                notes: None,
            }),
            notes: None,
        },
        app.clock.now(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_failed_email_retries_with_backoff_then_dead_letters() {
    let app = TestApp::in_memory();
    let email = Arc::new(FailingEmail::default());
    let dispatcher = OutboxDispatcher::new(
        app.store.clone(),
        app.bus.clone(),
        email.clone(),
        app.clock.clone(),
        app.state.policy.clone(),
        config(),
    );

    let user = unique_user();
    let order = place_cash_order(&app, &user).await;
    assert_eq!(order.status, OrderStatus::PendingConfirmation);

    // Award succeeds, email fails
    let first = dispatcher.run_once().await.unwrap();
    assert_eq!(
        first,
        DispatchReport {
            processed: 1,
            retried: 1,
            dead_lettered: 0
        }
    );
    let wallet = wallet_service::get_wallet(app.store.as_ref(), &app.state.policy, &user)
        .await
        .unwrap();
    assert_eq!(wallet.points_balance, order.points_awarded);

    // Not due until the backoff elapses
    assert_eq!(dispatcher.run_once().await.unwrap(), DispatchReport::default());

    app.clock.advance(Duration::milliseconds(1_000));
    assert_eq!(dispatcher.run_once().await.unwrap().retried, 1);

    app.clock.advance(Duration::milliseconds(1_999));
    assert_eq!(dispatcher.run_once().await.unwrap(), DispatchReport::default());

    app.clock.advance(Duration::milliseconds(1));
    assert_eq!(dispatcher.run_once().await.unwrap().dead_lettered, 1);

    app.clock.advance(Duration::hours(1));
    assert_eq!(dispatcher.run_once().await.unwrap(), DispatchReport::default());
    assert_eq!(email.calls.load(Ordering::SeqCst), 3);

    // Order placement itself was never affected
    let stored = checkout_service::find_order(app.store.as_ref(), order.id)
        .await
        .unwrap();
    assert_eq!(stored.status, OrderStatus::PendingConfirmation);
}

#[tokio::test]
async fn test_unknown_event_type_is_dead_lettered_immediately() {
    let app = TestApp::in_memory();
    let event_id = Uuid::new_v4();
    app.store
        .enqueue(
            &NewOutboxEvent {
                event_id,
                event_type: "order.gift_wrap".to_string(),
                aggregate_id: "order-x".to_string(),
                payload: serde_json::json!({}),
            },
            app.clock.now(),
        )
        .await
        .unwrap();

    let report = app.dispatcher().run_once().await.unwrap();
    assert_eq!(report.dead_lettered, 1);

    let record = app
        .store
        .find_outbox_event(event_id)
        .await
        .unwrap()
        .unwrap();
    assert!(record.dead_lettered_at.is_some());
    assert!(record.processed_at.is_none());
    assert!(record.last_error.unwrap().contains("order.gift_wrap"));
}

#[tokio::test]
async fn test_processed_events_are_republished() {
    let app = TestApp::in_memory();
    let mut events = app.bus.subscribe("storefront.events.>").await.unwrap();

    let user = unique_user();
    let order = place_cash_order(&app, &user).await;
    app.dispatcher().run_once().await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        let message = tokio::time::timeout(std::time::Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        let envelope: EventEnvelope<serde_json::Value> =
            serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(envelope.aggregate_id, order.id.to_string());
        assert_eq!(envelope.source_module, "storefront");
        seen.push(message.subject);
    }
    seen.sort();
    assert_eq!(
        seen,
        vec![
            "storefront.events.order.confirmation_email".to_string(),
            "storefront.events.order.points_award".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_status_change_notifies_the_customer() {
    let app = TestApp::in_memory();
    let user = unique_user();
    let order = place_cash_order(&app, &user).await;
    app.dispatcher().run_once().await.unwrap();

    checkout_service::advance_order(
        app.store.as_ref(),
        order.id,
        OrderStatus::Confirmed,
        app.clock.now(),
    )
    .await
    .unwrap();
    let report = app.dispatcher().run_once().await.unwrap();
    assert_eq!(report.processed, 1);

    let inbox = notification_service::list_for_user(app.store.as_ref(), &user, 10)
        .await
        .unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(
        inbox[0].notification.title,
        format!("Order {}", order.order_number)
    );
    assert!(inbox[0].notification.body.contains("confirmed"));
    assert!(!inbox[0].read);

    // Someone else's inbox stays empty
    let other = notification_service::list_for_user(app.store.as_ref(), &unique_user(), 10)
        .await
        .unwrap();
    assert!(other.is_empty());
}
