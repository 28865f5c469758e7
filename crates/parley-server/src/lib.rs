pub mod api;
pub mod db;
pub mod directory;
pub mod engine;
pub mod error;
pub mod media;
pub mod session;
pub mod state;
pub mod ws;

pub use error::{MediaError, Result};

use std::sync::Arc;
use std::time::Duration;

use crate::directory::PgRoomDirectory;
use crate::engine::{EngineConfig, InProcessEngine, default_codecs};
use crate::media::{MediaSessions, RetryPolicy};
use crate::session::{RedisKv, SessionStore};
use crate::state::{AppState, Config};
use crate::ws::ConnectionManager;

/// Build the application router with production backends wired in.
pub async fn create_app(config: Config) -> anyhow::Result<axum::Router> {
    let pool = db::init_pool(&config.database_url).await?;
    let rooms = Arc::new(PgRoomDirectory::new(pool));

    let kv = Arc::new(RedisKv::connect(&config.redis_url).await?);
    let store = SessionStore::new(kv, Duration::from_secs(config.session_ttl_secs));

    let engine = Arc::new(InProcessEngine::new(EngineConfig {
        listen_ip: "0.0.0.0".to_string(),
        announced_ip: config.announced_ip.clone(),
        rtc_min_port: config.rtc_min_port,
        rtc_max_port: config.rtc_max_port,
        codecs: default_codecs(),
    }));

    let connections = ConnectionManager::new();
    let media = MediaSessions::new(
        engine,
        store,
        connections.clone(),
        config.worker_pool_size,
        RetryPolicy::default(),
    );
    media.initialize().await?;

    let state = AppState {
        config: Arc::new(config),
        connections,
        media,
        rooms,
    };
    Ok(api::create_router(state))
}
