use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use storefront_rs::{
    build_router,
    clock::{Clock, SystemClock},
    config::{Config, StoreType},
    db,
    events::{EventBus, InMemoryBus, NatsBus},
    metrics::Metrics,
    services::{
        chat_service::ChatAssistant,
        email::{EmailSender, HttpEmailSender, LogEmailSender},
        outbox_dispatcher::OutboxDispatcher,
        LedgerPolicy,
    },
    state::AppState,
    store::{InMemoryStore, PgStore, Store},
};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    // Load configuration from environment
    let config = Config::from_env().expect("Failed to load configuration from environment");

    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if config.log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        host = %config.host,
        port = config.port,
        store_type = ?config.store_type,
        bus_type = %config.bus_type,
        "Starting storefront service"
    );

    // Store
    let store: Arc<dyn Store> = match config.store_type {
        StoreType::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .expect("DATABASE_URL must be set when STORE_TYPE=postgres");

            tracing::info!("Connecting to database...");
            let pool = db::init_pool(database_url)
                .await
                .expect("Failed to connect to database");

            tracing::info!("Running migrations...");
            db::run_migrations(&pool)
                .await
                .expect("Failed to run migrations");

            Arc::new(PgStore::new(pool))
        }
        StoreType::InMemory => {
            tracing::warn!("Using in-memory store; data is lost on restart");
            Arc::new(InMemoryStore::new())
        }
    };

    // Event bus
    let bus: Arc<dyn EventBus> = match config.bus_type.to_lowercase().as_str() {
        "inmemory" => {
            tracing::info!("Using InMemory event bus");
            Arc::new(InMemoryBus::new())
        }
        "nats" => {
            tracing::info!(nats_url = %config.nats_url, "Connecting to NATS");
            let client = async_nats::connect(&config.nats_url)
                .await
                .expect("Failed to connect to NATS");
            Arc::new(NatsBus::new(client))
        }
        other => panic!("Invalid BUS_TYPE: {}. Must be 'inmemory' or 'nats'", other),
    };

    let email: Arc<dyn EmailSender> = match &config.email_function_url {
        Some(url) => Arc::new(
            HttpEmailSender::new(url.clone(), config.email_function_key.clone())
                .expect("Failed to build email client"),
        ),
        None => {
            tracing::warn!("EMAIL_FUNCTION_URL not set; confirmation emails will only be logged");
            Arc::new(LogEmailSender)
        }
    };

    let metrics = Metrics::new().expect("Failed to register metrics");
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let policy = LedgerPolicy::from_config(&config);
    let chat = ChatAssistant::from_config(&config.chat)
        .expect("Failed to build chat client")
        .with_metrics(metrics.clone());

    // Outbox dispatcher
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = OutboxDispatcher::new(
        store.clone(),
        bus.clone(),
        email,
        clock.clone(),
        policy.clone(),
        config.outbox.clone(),
    )
    .with_metrics(metrics.clone());
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_rx));

    let state = AppState {
        store,
        bus,
        clock,
        policy,
        chat: Arc::new(chat),
        metrics,
    };
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("Invalid HOST/PORT");
    tracing::info!("Storefront service listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server failed to start");

    let _ = shutdown_tx.send(true);
    if let Err(e) = dispatcher_handle.await {
        tracing::error!(error = %e, "Outbox dispatcher task failed");
    }
    tracing::info!("Storefront service stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}
