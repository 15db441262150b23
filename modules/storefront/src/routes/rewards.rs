use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use super::ApiError;
use crate::services::reward_service::{self, DailyGameStatus, RewardError, RewardGrant};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyGameRequest {
    pub caught_items: i64,
}

/// GET /api/rewards/{user_id}/daily-game
pub async fn daily_game_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<DailyGameStatus>, ApiError> {
    let status = reward_service::daily_game_status(
        state.store.as_ref(),
        &state.policy,
        &user_id,
        state.clock.now(),
    )
    .await?;
    Ok(Json(status))
}

/// POST /api/rewards/{user_id}/daily-game
pub async fn play_daily_game(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<DailyGameRequest>,
) -> Result<(StatusCode, Json<RewardGrant>), ApiError> {
    let result = reward_service::play_daily_game(
        state.store.as_ref(),
        &state.policy,
        &user_id,
        body.caught_items,
        state.clock.now(),
    )
    .await;

    let label = match &result {
        Ok(_) => "awarded",
        Err(RewardError::AlreadyClaimed { .. }) => "already_claimed",
        Err(RewardError::Store(_)) => "error",
        Err(_) => "rejected",
    };
    state
        .metrics
        .rewards_total
        .with_label_values(&["daily_game", label])
        .inc();

    Ok((StatusCode::CREATED, Json(result?)))
}
