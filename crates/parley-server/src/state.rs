use std::env;
use std::sync::Arc;

use anyhow::Context;

use crate::directory::RoomDirectory;
use crate::media::MediaSessions;
use crate::ws::ConnectionManager;

/// Server configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    pub redis_url: String,
    pub session_ttl_secs: u64,
    pub worker_pool_size: usize,
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3001".to_string()),
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            session_ttl_secs: parse_env("SESSION_TTL_SECS", 3600)?,
            worker_pool_size: parse_env("WORKER_POOL_SIZE", 4)?,
            announced_ip: env::var("ANNOUNCED_IP").ok(),
            rtc_min_port: parse_env("RTC_MIN_PORT", 10_000)?,
            rtc_max_port: parse_env("RTC_MAX_PORT", 10_999)?,
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{name} must be a valid number")),
        Err(_) => Ok(default),
    }
}

/// Shared application state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub connections: Arc<ConnectionManager>,
    pub media: Arc<MediaSessions>,
    pub rooms: Arc<dyn RoomDirectory>,
}
