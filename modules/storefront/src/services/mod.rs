pub mod chat_service;
pub mod checkout_service;
pub mod email;
pub mod notification_service;
pub mod outbox_dispatcher;
pub mod reward_service;
pub mod wallet_service;

use crate::clock::LedgerCalendar;
use crate::config::Config;

/// Business rules shared by the ledger, reward and checkout services
#[derive(Debug, Clone)]
pub struct LedgerPolicy {
    pub currency: String,
    pub calendar: LedgerCalendar,
    pub points_rate_percent: i64,
    pub daily_game_max_items: i64,
    pub ai_daily_reward_points: i64,
}

impl LedgerPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            currency: config.currency.clone(),
            calendar: LedgerCalendar::new(config.ledger_utc_offset_minutes),
            points_rate_percent: config.points_rate_percent,
            daily_game_max_items: config.daily_game_max_items,
            ai_daily_reward_points: config.ai_daily_reward_points,
        }
    }
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            currency: "EGP".to_string(),
            calendar: LedgerCalendar::new(120),
            points_rate_percent: 150,
            daily_game_max_items: 50,
            ai_daily_reward_points: 10,
        }
    }
}

/// User ids are opaque but never blank or padded with whitespace, and `all`
/// is reserved for broadcasts. Ids are storage keys, so `" u1"` is rejected
/// rather than becoming a second account next to `"u1"`.
pub(crate) fn valid_user_id(user_id: &str) -> bool {
    !user_id.is_empty()
        && user_id.trim() == user_id
        && user_id != crate::models::Audience::ALL
}
