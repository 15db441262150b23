use std::env;
use std::str::FromStr;

/// Which persistence backend the service runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    Postgres,
    InMemory,
}

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub store_type: StoreType,
    pub database_url: Option<String>,
    pub bus_type: String,
    pub nats_url: String,
    pub host: String,
    pub port: u16,
    pub log_format: String,

    pub currency: String,
    pub points_rate_percent: i64,
    pub daily_game_max_items: i64,
    pub ai_daily_reward_points: i64,
    pub ledger_utc_offset_minutes: i32,

    pub chat: ChatConfig,
    pub email_function_url: Option<String>,
    pub email_function_key: Option<String>,
    pub outbox: OutboxConfig,
}

/// Chat provider endpoints and keys
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub primary_url: String,
    pub primary_model: String,
    pub primary_api_key: Option<String>,
    pub fallback_url: String,
    pub fallback_api_key: Option<String>,
    pub timeout_secs: u64,
    pub history_window: usize,
}

/// Outbox dispatcher tuning
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub poll_interval_ms: u64,
    pub batch_size: i64,
    pub max_attempts: i32,
    pub initial_backoff_ms: u64,
    pub max_backoff_secs: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            batch_size: 50,
            max_attempts: 8,
            initial_backoff_ms: 500,
            max_backoff_secs: 300,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let store_type = match get("STORE_TYPE", "postgres").to_lowercase().as_str() {
            "postgres" => StoreType::Postgres,
            "inmemory" => StoreType::InMemory,
            other => {
                return Err(format!(
                    "Invalid STORE_TYPE: {}. Must be 'postgres' or 'inmemory'",
                    other
                ))
            }
        };

        let database_url = optional("DATABASE_URL");
        if store_type == StoreType::Postgres && database_url.is_none() {
            return Err("DATABASE_URL must be set when STORE_TYPE=postgres".to_string());
        }

        let chat = ChatConfig {
            primary_url: get(
                "CHAT_PRIMARY_URL",
                "https://api.openai.com/v1/chat/completions",
            ),
            primary_model: get("CHAT_PRIMARY_MODEL", "gpt-4o-mini"),
            primary_api_key: optional("CHAT_PRIMARY_API_KEY"),
            fallback_url: get(
                "CHAT_FALLBACK_URL",
                "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash:generateContent",
            ),
            fallback_api_key: optional("CHAT_FALLBACK_API_KEY"),
            timeout_secs: parse_var(&lookup, "CHAT_TIMEOUT_SECS", "20")?,
            history_window: parse_var(&lookup, "CHAT_HISTORY_WINDOW", "10")?,
        };

        let outbox = OutboxConfig {
            poll_interval_ms: parse_var(&lookup, "OUTBOX_POLL_INTERVAL_MS", "1000")?,
            batch_size: parse_var(&lookup, "OUTBOX_BATCH_SIZE", "50")?,
            max_attempts: parse_var(&lookup, "OUTBOX_MAX_ATTEMPTS", "8")?,
            initial_backoff_ms: parse_var(&lookup, "OUTBOX_INITIAL_BACKOFF_MS", "500")?,
            max_backoff_secs: parse_var(&lookup, "OUTBOX_MAX_BACKOFF_SECS", "300")?,
        };
        if outbox.max_attempts < 1 {
            return Err("OUTBOX_MAX_ATTEMPTS must be at least 1".to_string());
        }

        let points_rate_percent: i64 = parse_var(&lookup, "POINTS_RATE_PERCENT", "150")?;
        if points_rate_percent < 0 {
            return Err("POINTS_RATE_PERCENT must not be negative".to_string());
        }

        Ok(Config {
            store_type,
            database_url,
            bus_type: get("BUS_TYPE", "inmemory"),
            nats_url: get("NATS_URL", "nats://localhost:4222"),
            host: get("HOST", "0.0.0.0"),
            port: parse_var(&lookup, "PORT", "8095")?,
            log_format: get("LOG_FORMAT", "pretty"),
            currency: get("CURRENCY", "EGP"),
            points_rate_percent,
            daily_game_max_items: parse_var(&lookup, "DAILY_GAME_MAX_ITEMS", "50")?,
            ai_daily_reward_points: parse_var(&lookup, "AI_DAILY_REWARD_POINTS", "10")?,
            ledger_utc_offset_minutes: parse_var(&lookup, "LEDGER_UTC_OFFSET_MINUTES", "120")?,
            chat,
            email_function_url: optional("EMAIL_FUNCTION_URL"),
            email_function_key: optional("EMAIL_FUNCTION_KEY"),
            outbox,
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: &str) -> Result<T, String>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let raw = lookup(key).unwrap_or_else(|| default.to_string());
    raw.trim()
        .parse()
        .map_err(|_| format!("{} has an invalid value: {}", key, raw))
}
