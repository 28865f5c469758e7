//! Room directory
//!
//! Rooms are provisioned elsewhere; this layer only resolves a short
//! user-facing room code to the room's id. Backed by Postgres in
//! production and an in-memory map in tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn room_id_by_code(&self, code: &str) -> Result<Option<Uuid>>;
}

pub struct PgRoomDirectory {
    pool: PgPool,
}

impl PgRoomDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoomDirectory for PgRoomDirectory {
    async fn room_id_by_code(&self, code: &str) -> Result<Option<Uuid>> {
        let id = sqlx::query_scalar::<_, Uuid>("SELECT id FROM rooms WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }
}

#[derive(Default)]
pub struct MemoryRoomDirectory {
    rooms: RwLock<HashMap<String, Uuid>>,
}

impl MemoryRoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, code: &str, room_id: Uuid) {
        self.rooms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(code.to_string(), room_id);
    }
}

#[async_trait]
impl RoomDirectory for MemoryRoomDirectory {
    async fn room_id_by_code(&self, code: &str) -> Result<Option<Uuid>> {
        Ok(self
            .rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(code)
            .copied())
    }
}
