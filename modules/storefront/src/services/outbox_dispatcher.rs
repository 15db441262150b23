//! Outbox dispatcher
//!
//! Drains `events_outbox` rows written alongside orders and status changes,
//! runs the side effect for each, and re-publishes processed events on the
//! bus. Failed rows are retried with exponential backoff and dead-lettered
//! after the configured number of attempts. Delivery is at-least-once:
//! points awards are keyed by order so a re-run never double-awards.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::email::{EmailError, EmailMessage, EmailSender};
use super::notification_service::{self, NotificationError};
use super::wallet_service::{self, AddPoints, LedgerError};
use super::LedgerPolicy;
use crate::clock::Clock;
use crate::config::OutboxConfig;
use crate::events::bus::publish_json;
use crate::events::payloads::{
    event_types, OrderConfirmationEmailPayload, OrderPointsAwardPayload, OrderStatusChangedPayload,
};
use crate::events::{subjects, EventBus, EventEnvelope};
use crate::metrics::Metrics;
use crate::models::OutboxRecord;
use crate::store::{order_award_key, OutboxStore, Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Email error: {0}")]
    Email(#[from] EmailError),

    #[error("Notification error: {0}")]
    Notification(#[from] NotificationError),
}

impl DispatchError {
    /// Errors that no amount of retrying will fix
    fn is_permanent(&self) -> bool {
        matches!(
            self,
            DispatchError::UnknownEventType(_)
                | DispatchError::InvalidPayload(_)
                | DispatchError::Ledger(LedgerError::InvalidUser)
                | DispatchError::Ledger(LedgerError::ZeroAmount)
                | DispatchError::Notification(NotificationError::InvalidUser)
        )
    }
}

/// Counts from one polling pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub processed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

/// Exponential backoff: `initial * 2^(attempt-1)`, capped at `max`
pub fn backoff_delay(config: &OutboxConfig, attempt: i32) -> Duration {
    let initial = Duration::from_millis(config.initial_backoff_ms);
    let max = Duration::from_secs(config.max_backoff_secs);
    let exponent = attempt.saturating_sub(1).clamp(0, 20) as u32;
    initial.saturating_mul(2u32.saturating_pow(exponent)).min(max)
}

pub struct OutboxDispatcher {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    email: Arc<dyn EmailSender>,
    clock: Arc<dyn Clock>,
    policy: LedgerPolicy,
    config: OutboxConfig,
    metrics: Option<Metrics>,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        email: Arc<dyn EmailSender>,
        clock: Arc<dyn Clock>,
        policy: LedgerPolicy,
        config: OutboxConfig,
    ) -> Self {
        Self {
            store,
            bus,
            email,
            clock,
            policy,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Poll until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        tracing::info!(
            poll_interval_ms = self.config.poll_interval_ms,
            max_attempts = self.config.max_attempts,
            "Outbox dispatcher started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!(error = %e, "Outbox polling pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Outbox dispatcher stopped");
    }

    /// Process every due row once
    pub async fn run_once(&self) -> Result<DispatchReport, StoreError> {
        let now = self.clock.now();
        let due = self.store.fetch_due(now, self.config.batch_size).await?;
        let mut report = DispatchReport::default();

        if !due.is_empty() {
            tracing::debug!(count = due.len(), "Dispatching outbox events");
        }

        for record in due {
            match self.handle(&record).await {
                Ok(()) => {
                    self.store.mark_processed(record.id, self.clock.now()).await?;
                    self.count(&record.event_type, "processed");
                    report.processed += 1;
                    self.republish(&record).await;
                }
                Err(e) => {
                    let attempt = record.attempts + 1;
                    let message = e.to_string();

                    if e.is_permanent() || attempt >= self.config.max_attempts {
                        self.store
                            .mark_dead(record.id, &message, self.clock.now())
                            .await?;
                        self.count(&record.event_type, "dead_lettered");
                        report.dead_lettered += 1;
                        tracing::error!(
                            event_id = %record.event_id,
                            event_type = %record.event_type,
                            attempt,
                            error = %message,
                            "Outbox event dead-lettered"
                        );
                    } else {
                        let delay = backoff_delay(&self.config, attempt);
                        let next_attempt_at = self.clock.now()
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::seconds(60));
                        self.store
                            .mark_retry(record.id, &message, next_attempt_at)
                            .await?;
                        self.count(&record.event_type, "retry");
                        report.retried += 1;
                        tracing::warn!(
                            event_id = %record.event_id,
                            event_type = %record.event_type,
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %message,
                            "Outbox event failed; will retry"
                        );
                    }
                }
            }
        }

        Ok(report)
    }

    async fn handle(&self, record: &OutboxRecord) -> Result<(), DispatchError> {
        match record.event_type.as_str() {
            event_types::ORDER_POINTS_AWARD => {
                let payload: OrderPointsAwardPayload =
                    serde_json::from_value(record.payload.clone())?;
                self.award_points(payload, record.created_at).await
            }
            event_types::ORDER_CONFIRMATION_EMAIL => {
                let payload: OrderConfirmationEmailPayload =
                    serde_json::from_value(record.payload.clone())?;
                self.email
                    .send(&EmailMessage {
                        to_user_id: payload.user_id.clone(),
                        template: "order_confirmation".to_string(),
                        data: serde_json::to_value(&payload)?,
                    })
                    .await?;
                Ok(())
            }
            event_types::ORDER_STATUS_CHANGED => {
                let payload: OrderStatusChangedPayload =
                    serde_json::from_value(record.payload.clone())?;
                notification_service::notify_user(
                    self.store.as_ref(),
                    self.bus.as_ref(),
                    &payload.user_id,
                    format!("Order {}", payload.order_number),
                    format!(
                        "Your order {} is now {}.",
                        payload.order_number,
                        payload.to.as_str().replace('_', " ")
                    ),
                    self.clock.now(),
                )
                .await?;
                Ok(())
            }
            other => Err(DispatchError::UnknownEventType(other.to_string())),
        }
    }

    /// The award lands in the month the order was placed
    async fn award_points(
        &self,
        payload: OrderPointsAwardPayload,
        placed_at: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        let outcome = wallet_service::add_points(
            self.store.as_ref(),
            &self.policy,
            AddPoints {
                user_id: payload.user_id.clone(),
                delta: payload.points,
                reason: format!("Order {}", payload.order_number),
                idempotency_key: Some(order_award_key(payload.order_id)),
            },
            placed_at,
        )
        .await?;

        if outcome.replayed {
            tracing::info!(
                order_id = %payload.order_id,
                "Order points already awarded; skipping"
            );
        }
        Ok(())
    }

    async fn republish(&self, record: &OutboxRecord) {
        let envelope = EventEnvelope::new(
            record.event_id,
            record.event_type.clone(),
            record.aggregate_id.clone(),
            record.created_at,
            &record.payload,
        );
        let subject = subjects::outbox_event(&record.event_type);

        if let Err(e) = publish_json(self.bus.as_ref(), &subject, &envelope).await {
            tracing::warn!(
                event_id = %record.event_id,
                subject = %subject,
                error = %e,
                "Failed to publish processed outbox event"
            );
        }
    }

    fn count(&self, event_type: &str, result: &str) {
        if let Some(metrics) = &self.metrics {
            metrics
                .outbox_dispatch_total
                .with_label_values(&[event_type, result])
                .inc();
        }
    }
}
