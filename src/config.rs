use std::str::FromStr;

use crate::error::{AppError, Result};
use crate::types::PollScope;

pub const UPSTREAM_URL: &str = "https://api.opticodds.com/api/v3";

/// Poll cadence (seconds). Upstream fixtures change slowly; the cycle is pre-warmed at start.
pub const POLL_INTERVAL_SECS: u64 = 3600;

/// Fixtures not sighted for this long while still scheduled/live are marked cancelled.
pub const STALE_AFTER_SECS: u64 = 6 * 3600;

/// Keep-alive cadence for idle subscriptions (seconds).
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Per-subscription outbound queue bound. Overflow drops the oldest message.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 100;

/// Consecutive failed sends before a subscription is closed.
pub const MAX_SEND_FAILURES: u32 = 3;

/// A send that has not completed after this long counts as a failed send (seconds).
pub const SEND_TIMEOUT_SECS: u64 = 10;

/// Consecutive storage-failed cycles before every further failure is logged as an alert.
pub const MAX_CONSECUTIVE_STORAGE_FAILURES: u32 = 3;

/// Upper bound on how long shutdown waits for an in-flight poll cycle.
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// Upstream request timeout (seconds).
pub const UPSTREAM_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StorageBackend::Sqlite),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(AppError::Config(format!(
                "STORAGE_BACKEND must be `sqlite` or `memory`, got `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub api_port: u16,
    pub storage_backend: StorageBackend,
    pub db_path: String,
    pub upstream_url: String,
    pub upstream_api_key: String,
    /// Sport/league pairs to poll (POLL_SCOPES, e.g. "football:nfl,basketball:nba")
    pub poll_scopes: Vec<PollScope>,
    pub poll_interval_secs: u64,
    /// Only fetch fixtures starting within this many days (POLL_LOOKAHEAD_DAYS)
    pub poll_lookahead_days: Option<i64>,
    pub stale_after_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub subscriber_queue_capacity: usize,
    pub max_send_failures: u32,
    pub send_timeout_secs: u64,
    pub max_consecutive_storage_failures: u32,
    pub shutdown_grace_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let poll_scopes: Vec<PollScope> = std::env::var("POLL_SCOPES")
            .unwrap_or_else(|_| "football:nfl".to_string())
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                PollScope::parse(s)
                    .ok_or_else(|| AppError::Config(format!("invalid POLL_SCOPES entry `{s}`")))
            })
            .collect::<Result<_>>()?;
        if poll_scopes.is_empty() {
            return Err(AppError::Config("POLL_SCOPES must name at least one sport".to_string()));
        }

        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            storage_backend: std::env::var("STORAGE_BACKEND")
                .unwrap_or_else(|_| "sqlite".to_string())
                .parse()?,
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "fixtures.db".to_string()),
            upstream_url: std::env::var("UPSTREAM_URL")
                .unwrap_or_else(|_| UPSTREAM_URL.to_string()),
            upstream_api_key: std::env::var("UPSTREAM_API_KEY").unwrap_or_default(),
            poll_scopes,
            poll_interval_secs: env_or("POLL_INTERVAL_SECS", POLL_INTERVAL_SECS).max(1),
            poll_lookahead_days: std::env::var("POLL_LOOKAHEAD_DAYS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|d| *d > 0),
            stale_after_secs: env_or("STALE_AFTER_SECS", STALE_AFTER_SECS),
            heartbeat_interval_secs: env_or("HEARTBEAT_INTERVAL_SECS", HEARTBEAT_INTERVAL_SECS)
                .max(1),
            subscriber_queue_capacity: env_or("SUBSCRIBER_QUEUE_CAPACITY", SUBSCRIBER_QUEUE_CAPACITY)
                .max(1),
            max_send_failures: env_or("MAX_SEND_FAILURES", MAX_SEND_FAILURES).max(1),
            send_timeout_secs: env_or("SEND_TIMEOUT_SECS", SEND_TIMEOUT_SECS).max(1),
            max_consecutive_storage_failures: env_or(
                "MAX_CONSECUTIVE_STORAGE_FAILURES",
                MAX_CONSECUTIVE_STORAGE_FAILURES,
            ),
            shutdown_grace_secs: env_or("SHUTDOWN_GRACE_SECS", SHUTDOWN_GRACE_SECS),
        })
    }
}

/// Numeric knobs fall back to their default when unset or unparsable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}
