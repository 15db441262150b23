use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use super::ApiError;
use crate::services::chat_service::ChatRequest;
use crate::services::reward_service;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub reply: String,
    pub provider: String,
    /// Set when this reply earned the daily assistant reward
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points_awarded: Option<i64>,
}

/// POST /api/chat
///
/// The daily interaction reward is best effort; a failed award never
/// fails the reply.
pub async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let reply = state.chat.reply(&request, &state.policy.currency).await?;

    let mut points_awarded = None;
    if let Some(user_id) = request.user_id.as_deref() {
        match reward_service::reward_ai_interaction(
            state.store.as_ref(),
            &state.policy,
            user_id,
            state.clock.now(),
        )
        .await
        {
            Ok(Some(grant)) => {
                state
                    .metrics
                    .rewards_total
                    .with_label_values(&["ai_interaction", "awarded"])
                    .inc();
                points_awarded = Some(grant.points);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Assistant reward failed");
            }
        }
    }

    Ok(Json(ChatResponse {
        reply: reply.reply,
        provider: reply.provider,
        points_awarded,
    }))
}
