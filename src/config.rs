use std::fmt;
use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::Duration;

use crate::feedback::reminders::{MAX_INTERVAL_DAYS, parse_interval};
use crate::feedback::scheduler::SchedulerConfig;
use crate::feedback::store::StorageLocation;

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// A required variable is not set.
    Missing(&'static str),
    /// A variable is set but cannot be parsed.
    Invalid { key: &'static str, reason: String },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(key) => write!(f, "{} is not set", key),
            Self::Invalid { key, reason } => write!(f, "invalid {}: {}", key, reason),
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

const DEFAULT_DATABASE_URL: &str = "sqlite://feedback.db";

pub struct Config {
    pub bot_token: String,
    /// The single owner allowed to authorize groups.
    pub owner_id: i64,
    pub storage: StorageLocation,
    /// How often an active reminder repeats.
    pub reminder_interval: Duration,
    pub scheduler: SchedulerConfig,
    /// Port of the liveness endpoint.
    pub port: u16,
    pub log_dir: PathBuf,
    /// Chat that receives WARN/ERROR logs.
    pub log_chat_id: Option<i64>,
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bot_token = get("BOT_TOKEN").ok_or(ConfigError::Missing("BOT_TOKEN"))?;
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "BOT_TOKEN appears invalid (expected format: 123456789:ABCdefGHI...)".into(),
            ));
        }

        let owner_id = get("OWNER_ID")
            .ok_or(ConfigError::Missing("OWNER_ID"))?
            .parse::<i64>()
            .map_err(|e| ConfigError::Invalid { key: "OWNER_ID", reason: e.to_string() })?;
        if owner_id <= 0 {
            return Err(ConfigError::Validation("OWNER_ID must be a positive user id".into()));
        }

        let storage = parse_database_url(
            get("DATABASE_URL").as_deref().unwrap_or(DEFAULT_DATABASE_URL),
        )?;

        let interval = |key: &'static str, default: &str| -> Result<Duration, ConfigError> {
            parse_interval(get(key).as_deref().unwrap_or(default))
                .map_err(|reason| ConfigError::Invalid { key, reason })
        };
        let reminder_interval = interval("REMINDER_INTERVAL", "120m")?;
        let retention_days: i64 = parse_number(get("RETENTION_DAYS"), "RETENTION_DAYS", 5)?;
        if !(1..=MAX_INTERVAL_DAYS).contains(&retention_days) {
            return Err(ConfigError::Validation(format!(
                "RETENTION_DAYS must be between 1 and {MAX_INTERVAL_DAYS}"
            )));
        }
        let scheduler = SchedulerConfig {
            cleanup_interval: to_std(interval("CLEANUP_INTERVAL", "1h")?),
            reminder_check_interval: to_std(interval("REMINDER_CHECK_INTERVAL", "60s")?),
            heartbeat_interval: to_std(interval("HEARTBEAT_INTERVAL", "10m")?),
            retention: Duration::days(retention_days),
        };

        let port = parse_number(get("PORT"), "PORT", 8000)?;
        let log_dir = get("LOG_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("logs"));
        let log_chat_id = get("LOG_CHAT_ID")
            .map(|v| {
                v.parse::<i64>()
                    .map_err(|e| ConfigError::Invalid { key: "LOG_CHAT_ID", reason: e.to_string() })
            })
            .transpose()?;

        Ok(Self {
            bot_token,
            owner_id,
            storage,
            reminder_interval,
            scheduler,
            port,
            log_dir,
            log_chat_id,
        })
    }
}

fn parse_number<T: std::str::FromStr>(
    value: Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    match value {
        Some(v) => v.parse().map_err(|e: T::Err| ConfigError::Invalid { key, reason: e.to_string() }),
        None => Ok(default),
    }
}

fn to_std(interval: Duration) -> StdDuration {
    // parse_interval only yields positive durations
    interval.to_std().unwrap_or(StdDuration::from_secs(1))
}

/// Accepts `sqlite://path`, `sqlite:path`, `sqlite::memory:`, `:memory:` or a bare path.
pub fn parse_database_url(url: &str) -> Result<StorageLocation, ConfigError> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);

    if rest == ":memory:" {
        return Ok(StorageLocation::Memory);
    }
    if rest.contains("://") || rest.is_empty() {
        return Err(ConfigError::Invalid {
            key: "DATABASE_URL",
            reason: format!("unsupported storage '{}', expected a sqlite path", url),
        });
    }
    Ok(StorageLocation::File(PathBuf::from(rest)))
}
