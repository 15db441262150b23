//! Notification routes and the real-time stream
//!
//! The stream is a server-sent event feed of `created`/`deleted` events
//! addressed to the user (or to everyone). Clients reconnect on drop and
//! re-list to fill any gap.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use uuid::Uuid;

use super::{ApiError, ListQuery};
use crate::events::payloads::NotificationEvent;
use crate::events::subjects;
use crate::models::NotificationView;
use crate::services::notification_service::{self, visible_to};
use crate::services::valid_user_id;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreadCount {
    pub user_id: String,
    pub unread: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub notification_id: Uuid,
    /// False when the notification was already read
    pub changed: bool,
}

/// GET /api/notifications/{user_id}
pub async fn list_notifications(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<NotificationView>>, ApiError> {
    let rows =
        notification_service::list_for_user(state.store.as_ref(), &user_id, query.limit()).await?;
    Ok(Json(rows))
}

/// GET /api/notifications/{user_id}/unread-count
pub async fn unread_count(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UnreadCount>, ApiError> {
    let unread = notification_service::unread_count(state.store.as_ref(), &user_id).await?;
    Ok(Json(UnreadCount { user_id, unread }))
}

/// POST /api/notifications/{user_id}/{notification_id}/read
pub async fn mark_read(
    State(state): State<AppState>,
    Path((user_id, notification_id)): Path<(String, Uuid)>,
) -> Result<Json<ReadReceipt>, ApiError> {
    let changed = notification_service::mark_read(
        state.store.as_ref(),
        notification_id,
        &user_id,
        state.clock.now(),
    )
    .await?;
    Ok(Json(ReadReceipt {
        notification_id,
        changed,
    }))
}

/// GET /api/notifications/{user_id}/stream
pub async fn stream(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if !valid_user_id(&user_id) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_user",
            "Invalid user id",
            "معرّف المستخدم غير صالح",
        ));
    }

    let mut messages = state
        .bus
        .subscribe(subjects::NOTIFICATIONS_ALL)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to subscribe to notification events");
            ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "stream_unavailable",
                "Live notifications are unavailable",
                "الإشعارات المباشرة غير متاحة حالياً",
            )
        })?;

    tracing::debug!(user_id = %user_id, "Notification stream opened");

    let events = async_stream::stream! {
        while let Some(message) = messages.next().await {
            let event: NotificationEvent = match serde_json::from_slice(&message.payload) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(subject = %message.subject, error = %e, "Dropping malformed notification event");
                    continue;
                }
            };
            if !visible_to(&event, &user_id) {
                continue;
            }
            match Event::default().event(event.kind.as_str()).json_data(&event) {
                Ok(sse) => yield Ok::<Event, Infallible>(sse),
                Err(e) => tracing::warn!(error = %e, "Failed to encode notification event"),
            }
        }
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
