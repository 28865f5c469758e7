//! Key-value backend for the session store
//!
//! `SessionKv` is the narrow surface the store needs: point reads, set
//! reads, and an atomic batch of writes. `RedisKv` backs production with
//! a connection-manager client; `MemoryKv` backs tests without a server.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One write in an atomic batch.
#[derive(Debug, Clone)]
pub enum KvOp {
    /// Set a string value with a TTL.
    SetEx {
        key: String,
        value: String,
        ttl: Duration,
    },
    /// Delete a key of any type.
    Del { key: String },
    /// Add a member to a set.
    SAdd { key: String, member: String },
    /// Remove a member from a set.
    SRem { key: String, member: String },
    /// Refresh a key's TTL.
    Expire { key: String, ttl: Duration },
}

#[async_trait]
pub trait SessionKv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Batched point reads; the result vec is positionally aligned with
    /// `keys`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Apply every op or none of them.
    async fn apply(&self, ops: Vec<KvOp>) -> Result<(), StoreError>;
}

/// Redis-backed implementation used in production.
pub struct RedisKv {
    conn: redis::aio::ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl SessionKv for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        Ok(conn.mget(keys).await?)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn apply(&self, ops: Vec<KvOp>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                KvOp::SetEx { key, value, ttl } => {
                    pipe.set_ex(key, value, ttl.as_secs()).ignore();
                }
                KvOp::Del { key } => {
                    pipe.del(key).ignore();
                }
                KvOp::SAdd { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                KvOp::SRem { key, member } => {
                    pipe.srem(key, member).ignore();
                }
                KvOp::Expire { key, ttl } => {
                    pipe.expire(key, ttl.as_secs() as i64).ignore();
                }
            }
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

enum MemoryValue {
    Text(String),
    Set(HashSet<String>),
}

struct MemoryEntry {
    value: MemoryValue,
    expires_at: Option<tokio::time::Instant>,
}

impl MemoryEntry {
    fn expired(&self, now: tokio::time::Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory implementation for tests. Expiry is lazy and driven by the
/// tokio clock so time-paused tests can advance it deterministically.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired(entries: &mut HashMap<String, MemoryEntry>) {
        let now = tokio::time::Instant::now();
        entries.retain(|_, entry| !entry.expired(now));
    }

    /// Number of live keys; test helper.
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge_expired(&mut entries);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionKv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge_expired(&mut entries);
        Ok(entries.get(key).and_then(|entry| match &entry.value {
            MemoryValue::Text(s) => Some(s.clone()),
            MemoryValue::Set(_) => None,
        }))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge_expired(&mut entries);
        Ok(keys
            .iter()
            .map(|key| {
                entries.get(key).and_then(|entry| match &entry.value {
                    MemoryValue::Text(s) => Some(s.clone()),
                    MemoryValue::Set(_) => None,
                })
            })
            .collect())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge_expired(&mut entries);
        Ok(entries
            .get(key)
            .map(|entry| match &entry.value {
                MemoryValue::Set(members) => members.iter().cloned().collect(),
                MemoryValue::Text(_) => Vec::new(),
            })
            .unwrap_or_default())
    }

    async fn apply(&self, ops: Vec<KvOp>) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge_expired(&mut entries);
        let now = tokio::time::Instant::now();
        for op in ops {
            match op {
                KvOp::SetEx { key, value, ttl } => {
                    entries.insert(
                        key,
                        MemoryEntry {
                            value: MemoryValue::Text(value),
                            expires_at: Some(now + ttl),
                        },
                    );
                }
                KvOp::Del { key } => {
                    entries.remove(&key);
                }
                KvOp::SAdd { key, member } => match entries.get_mut(&key) {
                    Some(MemoryEntry {
                        value: MemoryValue::Set(members),
                        ..
                    }) => {
                        members.insert(member);
                    }
                    _ => {
                        entries.insert(
                            key,
                            MemoryEntry {
                                value: MemoryValue::Set(HashSet::from([member])),
                                expires_at: None,
                            },
                        );
                    }
                },
                KvOp::SRem { key, member } => {
                    let emptied = match entries.get_mut(&key) {
                        Some(MemoryEntry {
                            value: MemoryValue::Set(members),
                            ..
                        }) => {
                            members.remove(&member);
                            members.is_empty()
                        }
                        _ => false,
                    };
                    if emptied {
                        entries.remove(&key);
                    }
                }
                KvOp::Expire { key, ttl } => {
                    if let Some(entry) = entries.get_mut(&key) {
                        entry.expires_at = Some(now + ttl);
                    }
                }
            }
        }
        Ok(())
    }
}
