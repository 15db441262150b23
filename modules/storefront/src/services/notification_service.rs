//! Admin broadcasts and per-user notifications
//!
//! Rows are committed first; the real-time `created`/`deleted` events are
//! published afterwards and a publish failure never undoes the write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::valid_user_id;
use crate::events::bus::publish_json;
use crate::events::payloads::{NotificationEvent, NotificationEventKind};
use crate::events::{subjects, EventBus};
use crate::models::{Audience, Notification, NotificationView};
use crate::store::{NotificationStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("Title is required")]
    EmptyTitle,

    #[error("Body is required")]
    EmptyBody,

    #[error("Audience must be 'all' or a user id")]
    InvalidAudience,

    #[error("Invalid user id")]
    InvalidUser,

    #[error("Notification not found: {0}")]
    NotFound(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNotification {
    pub title: String,
    pub body: String,
    pub audience: String,
}

pub async fn create_notification<S: NotificationStore + ?Sized>(
    store: &S,
    bus: &dyn EventBus,
    request: CreateNotification,
    now: DateTime<Utc>,
) -> Result<Notification, NotificationError> {
    let title = request.title.trim();
    let body = request.body.trim();
    if title.is_empty() {
        return Err(NotificationError::EmptyTitle);
    }
    if body.is_empty() {
        return Err(NotificationError::EmptyBody);
    }
    let audience = Audience::parse(&request.audience).ok_or(NotificationError::InvalidAudience)?;

    let notification = Notification {
        id: Uuid::new_v4(),
        title: title.to_string(),
        body: body.to_string(),
        audience,
        created_at: now,
    };
    store.insert_notification(&notification).await?;

    tracing::info!(
        notification_id = %notification.id,
        audience = %notification.audience.as_str(),
        "Notification created"
    );

    broadcast(bus, NotificationEventKind::Created, &notification).await;
    Ok(notification)
}

pub async fn delete_notification<S: NotificationStore + ?Sized>(
    store: &S,
    bus: &dyn EventBus,
    notification_id: Uuid,
) -> Result<Notification, NotificationError> {
    let notification = store
        .delete_notification(notification_id)
        .await?
        .ok_or(NotificationError::NotFound(notification_id))?;

    tracing::info!(notification_id = %notification_id, "Notification deleted");

    broadcast(bus, NotificationEventKind::Deleted, &notification).await;
    Ok(notification)
}

/// Direct message to one user (order updates and similar)
pub async fn notify_user<S: NotificationStore + ?Sized>(
    store: &S,
    bus: &dyn EventBus,
    user_id: &str,
    title: String,
    body: String,
    now: DateTime<Utc>,
) -> Result<Notification, NotificationError> {
    if !valid_user_id(user_id) {
        return Err(NotificationError::InvalidUser);
    }
    create_notification(
        store,
        bus,
        CreateNotification {
            title,
            body,
            audience: user_id.to_string(),
        },
        now,
    )
    .await
}

pub async fn list_for_user<S: NotificationStore + ?Sized>(
    store: &S,
    user_id: &str,
    limit: i64,
) -> Result<Vec<NotificationView>, NotificationError> {
    if !valid_user_id(user_id) {
        return Err(NotificationError::InvalidUser);
    }
    Ok(store.list_notifications(user_id, limit).await?)
}

/// Idempotent; returns whether this call changed the read state
pub async fn mark_read<S: NotificationStore + ?Sized>(
    store: &S,
    notification_id: Uuid,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, NotificationError> {
    if !valid_user_id(user_id) {
        return Err(NotificationError::InvalidUser);
    }
    store
        .mark_notification_read(notification_id, user_id, now)
        .await
        .map_err(|e| match e {
            StoreError::NotFound(_) => NotificationError::NotFound(notification_id),
            other => other.into(),
        })
}

pub async fn unread_count<S: NotificationStore + ?Sized>(
    store: &S,
    user_id: &str,
) -> Result<i64, NotificationError> {
    if !valid_user_id(user_id) {
        return Err(NotificationError::InvalidUser);
    }
    Ok(store.unread_count(user_id).await?)
}

/// Whether a real-time event belongs on `user_id`'s stream
pub fn visible_to(event: &NotificationEvent, user_id: &str) -> bool {
    event.notification.audience.includes(user_id)
}

async fn broadcast(bus: &dyn EventBus, kind: NotificationEventKind, notification: &Notification) {
    let event = NotificationEvent {
        kind,
        notification: notification.clone(),
    };
    if let Err(e) = publish_json(bus, &subjects::notification(kind.as_str()), &event).await {
        tracing::warn!(
            notification_id = %notification.id,
            kind = kind.as_str(),
            error = %e,
            "Failed to publish notification event"
        );
    }
}
