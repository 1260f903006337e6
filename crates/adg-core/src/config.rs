use std::{env, time::Duration};

use crate::{errors::Error, settings::ChatPolicy, Result};

/// Process configuration, read once at startup.
///
/// Per-chat tunables live in [`ChatPolicy`]; the copy held here is the
/// process-wide default layer (`ADS_*` env vars over compiled-in values).
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub telegram_bot_token: String,

    // Postgres
    pub database_url: String,
    pub database_max_connections: u32,

    // Flowise
    pub flowise_base_url: String,
    pub flowise_api_key: Option<String>,
    pub flowise_connect_timeout: Duration,
    pub flowise_read_timeout: Duration,

    // Runtime
    pub classify_max_concurrency: usize,
    pub dedup_ttl: Duration,
    pub weekly_grant_enabled: bool,

    pub policy_defaults: ChatPolicy,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN")
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config("TELEGRAM_BOT_TOKEN environment variable is required".to_string())
            })?;
        let database_url = env_str("DATABASE_URL").and_then(non_empty).ok_or_else(|| {
            Error::Config("DATABASE_URL environment variable is required".to_string())
        })?;
        let database_max_connections = env_u32("DATABASE_MAX_CONNECTIONS").unwrap_or(10).max(1);

        let flowise_base_url = env_str("FLOWISE_BASE_URL")
            .and_then(non_empty)
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_default();
        if flowise_base_url.is_empty() {
            tracing::warn!("FLOWISE_BASE_URL is not set; classification will report missing config");
        }
        let flowise_api_key = env_str("FLOWISE_API_KEY").and_then(non_empty);
        let flowise_connect_timeout =
            Duration::from_secs(env_u64("FLOWISE_CONNECT_TIMEOUT").unwrap_or(5));
        let flowise_read_timeout =
            Duration::from_secs(env_u64("FLOWISE_READ_TIMEOUT").unwrap_or(75));

        let classify_max_concurrency = env_usize("CLASSIFY_MAX_CONCURRENCY").unwrap_or(4).max(1);
        let dedup_ttl = Duration::from_secs(env_u64("ADS_DEDUP_TTL_SEC").unwrap_or(600));
        let weekly_grant_enabled = env_bool("TOKENS_WEEKLY_GRANT").unwrap_or(true);

        Ok(Self {
            telegram_bot_token,
            database_url,
            database_max_connections,
            flowise_base_url,
            flowise_api_key,
            flowise_connect_timeout,
            flowise_read_timeout,
            classify_max_concurrency,
            dedup_ttl,
            weekly_grant_enabled,
            policy_defaults: ChatPolicy::from_env(),
        })
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
