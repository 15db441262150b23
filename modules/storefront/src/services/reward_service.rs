//! Once-per-day rewards
//!
//! The claim is a unique row keyed by (user, reward kind, ledger day), written
//! in the same transaction as the points it awards.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{valid_user_id, LedgerPolicy};
use crate::models::{ClaimOutcome, RewardClaim, RewardKind, Wallet};
use crate::store::{LedgerStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RewardError {
    #[error("Invalid user id")]
    InvalidUser,

    #[error("Caught items must not be negative: {0}")]
    NegativeCount(i64),

    #[error("Nothing was caught")]
    NothingCaught,

    #[error("{kind} reward already claimed for {claim_date}")]
    AlreadyClaimed {
        kind: RewardKind,
        claim_date: NaiveDate,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardGrant {
    pub kind: RewardKind,
    pub claim_date: NaiveDate,
    pub points: i64,
    pub wallet: Wallet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyGameStatus {
    pub user_id: String,
    pub claim_date: NaiveDate,
    pub played: bool,
    pub max_points: i64,
}

async fn claim<S: LedgerStore + ?Sized>(
    store: &S,
    policy: &LedgerPolicy,
    user_id: &str,
    kind: RewardKind,
    points: i64,
    now: DateTime<Utc>,
) -> Result<RewardGrant, RewardError> {
    let claim = RewardClaim {
        user_id: user_id.to_string(),
        kind,
        claim_date: policy.calendar.day(now),
        points,
        month: policy.calendar.month_key(now),
    };

    match store.claim_reward(&claim, &policy.currency).await? {
        ClaimOutcome::Awarded(outcome) => {
            tracing::info!(
                user_id = %user_id,
                kind = %kind,
                points,
                claim_date = %claim.claim_date,
                "Daily reward awarded"
            );
            Ok(RewardGrant {
                kind,
                claim_date: claim.claim_date,
                points,
                wallet: outcome.wallet,
            })
        }
        ClaimOutcome::AlreadyClaimed => Err(RewardError::AlreadyClaimed {
            kind,
            claim_date: claim.claim_date,
        }),
    }
}

/// Award one point per caught item, capped, once per ledger day
pub async fn play_daily_game<S: LedgerStore + ?Sized>(
    store: &S,
    policy: &LedgerPolicy,
    user_id: &str,
    caught_items: i64,
    now: DateTime<Utc>,
) -> Result<RewardGrant, RewardError> {
    if !valid_user_id(user_id) {
        return Err(RewardError::InvalidUser);
    }
    if caught_items < 0 {
        return Err(RewardError::NegativeCount(caught_items));
    }

    let points = caught_items.min(policy.daily_game_max_items);
    if points == 0 {
        return Err(RewardError::NothingCaught);
    }

    claim(store, policy, user_id, RewardKind::DailyGame, points, now).await
}

/// First assistant interaction of the day earns a fixed award.
/// Returns `None` when today's award was already given.
pub async fn reward_ai_interaction<S: LedgerStore + ?Sized>(
    store: &S,
    policy: &LedgerPolicy,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<RewardGrant>, RewardError> {
    if !valid_user_id(user_id) {
        return Err(RewardError::InvalidUser);
    }
    if policy.ai_daily_reward_points <= 0 {
        return Ok(None);
    }

    match claim(
        store,
        policy,
        user_id,
        RewardKind::AiInteraction,
        policy.ai_daily_reward_points,
        now,
    )
    .await
    {
        Ok(grant) => Ok(Some(grant)),
        Err(RewardError::AlreadyClaimed { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

pub async fn daily_game_status<S: LedgerStore + ?Sized>(
    store: &S,
    policy: &LedgerPolicy,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<DailyGameStatus, RewardError> {
    if !valid_user_id(user_id) {
        return Err(RewardError::InvalidUser);
    }

    let claim_date = policy.calendar.day(now);
    let played = store
        .has_claimed(user_id, RewardKind::DailyGame, claim_date)
        .await?;

    Ok(DailyGameStatus {
        user_id: user_id.to_string(),
        claim_date,
        played,
        max_points: policy.daily_game_max_items,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use chrono::{Duration, TimeZone};

    fn morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 10, 7, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_game_caps_points_at_max_items() {
        let store = InMemoryStore::new();
        let policy = LedgerPolicy::default();

        let grant = play_daily_game(&store, &policy, "u1", 80, morning())
            .await
            .unwrap();
        assert_eq!(grant.points, 50);
        assert_eq!(grant.wallet.points_balance, 50);
    }

    #[tokio::test]
    async fn test_padded_user_id_cannot_claim_twice() {
        let store = InMemoryStore::new();
        let policy = LedgerPolicy::default();

        play_daily_game(&store, &policy, "u1", 50, morning()).await.unwrap();
        for padded in [" u1", "u1 ", "\tu1"] {
            assert!(matches!(
                play_daily_game(&store, &policy, padded, 50, morning()).await,
                Err(RewardError::InvalidUser)
            ));
            assert!(matches!(
                reward_ai_interaction(&store, &policy, padded, morning()).await,
                Err(RewardError::InvalidUser)
            ));
        }

        let wallet = store.find_wallet("u1").await.unwrap().unwrap();
        assert_eq!(wallet.points_balance, 50);
        assert!(store.find_wallet(" u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_ledger_day_can_claim_again() {
        let store = InMemoryStore::new();
        let policy = LedgerPolicy::default();

        play_daily_game(&store, &policy, "u1", 10, morning()).await.unwrap();
        let status = daily_game_status(&store, &policy, "u1", morning()).await.unwrap();
        assert!(status.played);

        // 22:30 UTC is already the next day at UTC+2
        let late = Utc.with_ymd_and_hms(2025, 6, 10, 22, 30, 0).unwrap();
        let grant = play_daily_game(&store, &policy, "u1", 5, late).await.unwrap();
        assert_eq!(grant.claim_date, NaiveDate::from_ymd_opt(2025, 6, 11).unwrap());
        assert_eq!(grant.wallet.points_balance, 15);
    }

    #[tokio::test]
    async fn test_rejects_negative_and_empty_catches() {
        let store = InMemoryStore::new();
        let policy = LedgerPolicy::default();

        assert!(matches!(
            play_daily_game(&store, &policy, "u1", -1, morning()).await,
            Err(RewardError::NegativeCount(-1))
        ));
        assert!(matches!(
            play_daily_game(&store, &policy, "u1", 0, morning()).await,
            Err(RewardError::NothingCaught)
        ));
        // A zero catch does not use up the day
        assert!(play_daily_game(&store, &policy, "u1", 3, morning()).await.is_ok());
    }

    #[tokio::test]
    async fn test_ai_reward_once_per_day() {
        let store = InMemoryStore::new();
        let policy = LedgerPolicy::default();

        let first = reward_ai_interaction(&store, &policy, "u1", morning())
            .await
            .unwrap();
        assert_eq!(first.map(|g| g.points), Some(10));

        let second = reward_ai_interaction(&store, &policy, "u1", morning() + Duration::hours(1))
            .await
            .unwrap();
        assert!(second.is_none());
    }
}
