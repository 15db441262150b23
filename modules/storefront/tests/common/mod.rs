//! Shared helpers for storefront integration tests
//!
//! In-memory tests build a full [`AppState`] around a fixed clock. Postgres
//! tests are `#[ignore]`d and read `DATABASE_URL`.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use http_body_util::BodyExt;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use storefront_rs::clock::FixedClock;
use storefront_rs::config::OutboxConfig;
use storefront_rs::db::{init_pool, run_migrations};
use storefront_rs::events::InMemoryBus;
use storefront_rs::metrics::Metrics;
use storefront_rs::models::Product;
use storefront_rs::services::chat_service::{ChatAssistant, ChatError, ChatMessage, ChatProvider};
use storefront_rs::services::email::LogEmailSender;
use storefront_rs::services::outbox_dispatcher::OutboxDispatcher;
use storefront_rs::services::LedgerPolicy;
use storefront_rs::store::{CatalogStore, InMemoryStore, PgStore, Store};
use storefront_rs::{build_router, AppState};

/// 2025-03-15 12:00 in the ledger's +02:00 calendar
pub fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 15, 10, 0, 0).unwrap()
}

pub fn unique_user() -> String {
    format!("user-{}", Uuid::new_v4())
}

/// Chat provider that always answers with a fixed string
pub struct StaticProvider(pub &'static str, pub Option<&'static str>);

#[async_trait]
impl ChatProvider for StaticProvider {
    fn name(&self) -> &'static str {
        self.0
    }

    async fn complete(
        &self,
        _system_prompt: &str,
        _history: &[ChatMessage],
    ) -> Result<String, ChatError> {
        match self.1 {
            Some(answer) => Ok(answer.to_string()),
            None => Err(ChatError::Upstream {
                status: 503,
                body: "down".to_string(),
            }),
        }
    }
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<dyn Store>,
    pub bus: Arc<InMemoryBus>,
    pub clock: Arc<FixedClock>,
}

impl TestApp {
    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(InMemoryStore::new()))
    }

    pub fn with_store(store: Arc<dyn Store>) -> Self {
        let bus = Arc::new(InMemoryBus::new());
        let clock = Arc::new(FixedClock::new(test_now()));
        let chat = ChatAssistant::new(
            Arc::new(StaticProvider("primary", Some("Try the fresh mangoes"))),
            Arc::new(StaticProvider("fallback", None)),
            10,
        );

        let state = AppState {
            store: store.clone(),
            bus: bus.clone(),
            clock: clock.clone(),
            policy: LedgerPolicy::default(),
            chat: Arc::new(chat),
            metrics: Metrics::new().unwrap(),
        };

        Self {
            state,
            store,
            bus,
            clock,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub fn dispatcher(&self) -> OutboxDispatcher {
        OutboxDispatcher::new(
            self.store.clone(),
            self.bus.clone(),
            Arc::new(LogEmailSender),
            self.clock.clone(),
            self.state.policy.clone(),
            OutboxConfig::default(),
        )
    }

    pub async fn seed_product(&self, id: &str, price_minor: i64) -> Product {
        let product = Product {
            id: id.to_string(),
            name_en: format!("Product {}", id),
            name_ar: format!("منتج {}", id),
            price_minor,
            category_id: Some("produce".to_string()),
            image_url: None,
            is_active: true,
        };
        self.store.upsert_product(&product).await.unwrap();
        product
    }
}

/// Read response body as JSON.
pub async fn body_json(response: axum::http::Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}

/// Connect to `DATABASE_URL` and apply migrations
pub async fn setup_pool() -> PgPool {
    dotenvy::dotenv().ok();
    if std::env::var("DB_MAX_CONNECTIONS").is_err() {
        std::env::set_var("DB_MAX_CONNECTIONS", "5");
    }

    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for Postgres tests");
    let pool = init_pool(&url)
        .await
        .expect("Failed to connect to test database");
    run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

pub async fn pg_app() -> (TestApp, PgPool) {
    let pool = setup_pool().await;
    let app = TestApp::with_store(Arc::new(PgStore::new(pool.clone())));
    (app, pool)
}
