//! Distributed session state
//!
//! Every piece of per-connection signaling state lives in a TTL-bounded
//! key-value store so an abandoned session can never outlive the TTL even
//! if explicit cleanup is skipped. Keys are namespaced per entity:
//!
//!   peer:{connection_id}               serialized [`PeerRecord`]
//!   peer:{connection_id}:transports    set of transport ids
//!   peer:{connection_id}:producers     set of producer ids
//!   peer:{connection_id}:consumers     set of consumer ids
//!   transport:{transport_id}           serialized [`TransportRecord`]
//!   producer:{producer_id}             serialized [`ProducerRecord`]
//!   consumer:{consumer_id}             serialized [`ConsumerRecord`]
//!   room:{room_id}:router              router id
//!   room:{room_id}:peers               set of connection ids
//!
//! Reads are self-healing: a record that fails to parse is deleted and
//! reported as absent, and set members whose records are gone are pruned
//! from the set on the way out.

mod kv;

pub use kv::{KvOp, MemoryKv, RedisKv, SessionKv, StoreError};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use parley_protocol::MediaKind;

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

/// A connected peer's membership in a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub room_id: Uuid,
    pub peer_id: Uuid,
    pub user_id: Option<Uuid>,
    pub peer_name: String,
    pub connection_id: Uuid,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportRecord {
    pub id: Uuid,
    pub producing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerRecord {
    pub id: Uuid,
    pub kind: MediaKind,
    pub peer_id: Uuid,
    pub connection_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerRecord {
    pub id: Uuid,
    pub producer_id: Uuid,
    pub connection_id: Uuid,
}

fn peer_key(connection_id: Uuid) -> String {
    format!("peer:{connection_id}")
}

fn peer_transports_key(connection_id: Uuid) -> String {
    format!("peer:{connection_id}:transports")
}

fn peer_producers_key(connection_id: Uuid) -> String {
    format!("peer:{connection_id}:producers")
}

fn peer_consumers_key(connection_id: Uuid) -> String {
    format!("peer:{connection_id}:consumers")
}

fn transport_key(transport_id: Uuid) -> String {
    format!("transport:{transport_id}")
}

fn producer_key(producer_id: Uuid) -> String {
    format!("producer:{producer_id}")
}

fn consumer_key(consumer_id: Uuid) -> String {
    format!("consumer:{consumer_id}")
}

fn room_router_key(room_id: Uuid) -> String {
    format!("room:{room_id}:router")
}

fn room_peers_key(room_id: Uuid) -> String {
    format!("room:{room_id}:peers")
}

#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn SessionKv>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn SessionKv>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store the peer record and add it to the room's member set in one
    /// atomic batch.
    pub async fn put_peer(&self, record: &PeerRecord) -> Result<(), StoreError> {
        let value = serde_json::to_string(record)?;
        self.kv
            .apply(vec![
                KvOp::SetEx {
                    key: peer_key(record.connection_id),
                    value,
                    ttl: self.ttl,
                },
                KvOp::SAdd {
                    key: room_peers_key(record.room_id),
                    member: record.connection_id.to_string(),
                },
                KvOp::Expire {
                    key: room_peers_key(record.room_id),
                    ttl: self.ttl,
                },
            ])
            .await
    }

    pub async fn get_peer(&self, connection_id: Uuid) -> Result<Option<PeerRecord>, StoreError> {
        self.read_record(&peer_key(connection_id)).await
    }

    pub async fn add_transport(
        &self,
        connection_id: Uuid,
        record: &TransportRecord,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_string(record)?;
        self.kv
            .apply(vec![
                KvOp::SetEx {
                    key: transport_key(record.id),
                    value,
                    ttl: self.ttl,
                },
                KvOp::SAdd {
                    key: peer_transports_key(connection_id),
                    member: record.id.to_string(),
                },
                KvOp::Expire {
                    key: peer_transports_key(connection_id),
                    ttl: self.ttl,
                },
            ])
            .await
    }

    pub async fn remove_transport(
        &self,
        connection_id: Uuid,
        transport_id: Uuid,
    ) -> Result<(), StoreError> {
        self.kv
            .apply(vec![
                KvOp::Del {
                    key: transport_key(transport_id),
                },
                KvOp::SRem {
                    key: peer_transports_key(connection_id),
                    member: transport_id.to_string(),
                },
            ])
            .await
    }

    pub async fn peer_transports(
        &self,
        connection_id: Uuid,
    ) -> Result<Vec<TransportRecord>, StoreError> {
        self.read_set_records(&peer_transports_key(connection_id), transport_key)
            .await
    }

    pub async fn add_producer(
        &self,
        connection_id: Uuid,
        record: &ProducerRecord,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_string(record)?;
        self.kv
            .apply(vec![
                KvOp::SetEx {
                    key: producer_key(record.id),
                    value,
                    ttl: self.ttl,
                },
                KvOp::SAdd {
                    key: peer_producers_key(connection_id),
                    member: record.id.to_string(),
                },
                KvOp::Expire {
                    key: peer_producers_key(connection_id),
                    ttl: self.ttl,
                },
            ])
            .await
    }

    pub async fn remove_producer(
        &self,
        connection_id: Uuid,
        producer_id: Uuid,
    ) -> Result<(), StoreError> {
        self.kv
            .apply(vec![
                KvOp::Del {
                    key: producer_key(producer_id),
                },
                KvOp::SRem {
                    key: peer_producers_key(connection_id),
                    member: producer_id.to_string(),
                },
            ])
            .await
    }

    pub async fn peer_producers(
        &self,
        connection_id: Uuid,
    ) -> Result<Vec<ProducerRecord>, StoreError> {
        self.read_set_records(&peer_producers_key(connection_id), producer_key)
            .await
    }

    pub async fn producer_record(
        &self,
        producer_id: Uuid,
    ) -> Result<Option<ProducerRecord>, StoreError> {
        self.read_record(&producer_key(producer_id)).await
    }

    pub async fn consumer_record(
        &self,
        consumer_id: Uuid,
    ) -> Result<Option<ConsumerRecord>, StoreError> {
        self.read_record(&consumer_key(consumer_id)).await
    }

    pub async fn add_consumer(
        &self,
        connection_id: Uuid,
        record: &ConsumerRecord,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_string(record)?;
        self.kv
            .apply(vec![
                KvOp::SetEx {
                    key: consumer_key(record.id),
                    value,
                    ttl: self.ttl,
                },
                KvOp::SAdd {
                    key: peer_consumers_key(connection_id),
                    member: record.id.to_string(),
                },
                KvOp::Expire {
                    key: peer_consumers_key(connection_id),
                    ttl: self.ttl,
                },
            ])
            .await
    }

    pub async fn remove_consumer(
        &self,
        connection_id: Uuid,
        consumer_id: Uuid,
    ) -> Result<(), StoreError> {
        self.kv
            .apply(vec![
                KvOp::Del {
                    key: consumer_key(consumer_id),
                },
                KvOp::SRem {
                    key: peer_consumers_key(connection_id),
                    member: consumer_id.to_string(),
                },
            ])
            .await
    }

    pub async fn peer_consumers(
        &self,
        connection_id: Uuid,
    ) -> Result<Vec<ConsumerRecord>, StoreError> {
        self.read_set_records(&peer_consumers_key(connection_id), consumer_key)
            .await
    }

    pub async fn set_room_router(&self, room_id: Uuid, router_id: Uuid) -> Result<(), StoreError> {
        self.kv
            .apply(vec![KvOp::SetEx {
                key: room_router_key(room_id),
                value: router_id.to_string(),
                ttl: self.ttl,
            }])
            .await
    }

    /// Drop only the room's router record, leaving the member set alone.
    pub async fn clear_room_router(&self, room_id: Uuid) -> Result<(), StoreError> {
        self.kv
            .apply(vec![KvOp::Del {
                key: room_router_key(room_id),
            }])
            .await
    }

    pub async fn room_router(&self, room_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        let key = room_router_key(room_id);
        match self.kv.get(&key).await? {
            Some(raw) => match raw.parse::<Uuid>() {
                Ok(id) => Ok(Some(id)),
                Err(_) => {
                    tracing::warn!("Dropping malformed record at {key}");
                    self.kv.apply(vec![KvOp::Del { key }]).await?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Connection ids of every peer currently in the room.
    pub async fn room_peers(&self, room_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let key = room_peers_key(room_id);
        let members = self.kv.smembers(&key).await?;
        let mut ids = Vec::with_capacity(members.len());
        for member in members {
            match member.parse::<Uuid>() {
                Ok(id) => ids.push(id),
                Err(_) => {
                    tracing::warn!("Pruning malformed member from {key}");
                    self.kv.apply(vec![KvOp::SRem { key: key.clone(), member }]).await?;
                }
            }
        }
        Ok(ids)
    }

    pub async fn remove_peer_from_room(
        &self,
        room_id: Uuid,
        connection_id: Uuid,
    ) -> Result<(), StoreError> {
        self.kv
            .apply(vec![KvOp::SRem {
                key: room_peers_key(room_id),
                member: connection_id.to_string(),
            }])
            .await
    }

    /// Delete everything keyed to a connection: transport, producer and
    /// consumer records, their index sets, the room membership, and the
    /// peer record itself. One atomic batch.
    pub async fn cleanup_peer(&self, connection_id: Uuid) -> Result<(), StoreError> {
        let peer = self.get_peer(connection_id).await?;

        let mut ops = Vec::new();
        for member in self.kv.smembers(&peer_transports_key(connection_id)).await? {
            if let Ok(id) = member.parse::<Uuid>() {
                ops.push(KvOp::Del { key: transport_key(id) });
            }
        }
        for member in self.kv.smembers(&peer_producers_key(connection_id)).await? {
            if let Ok(id) = member.parse::<Uuid>() {
                ops.push(KvOp::Del { key: producer_key(id) });
            }
        }
        for member in self.kv.smembers(&peer_consumers_key(connection_id)).await? {
            if let Ok(id) = member.parse::<Uuid>() {
                ops.push(KvOp::Del { key: consumer_key(id) });
            }
        }
        ops.push(KvOp::Del {
            key: peer_transports_key(connection_id),
        });
        ops.push(KvOp::Del {
            key: peer_producers_key(connection_id),
        });
        ops.push(KvOp::Del {
            key: peer_consumers_key(connection_id),
        });
        if let Some(peer) = peer {
            ops.push(KvOp::SRem {
                key: room_peers_key(peer.room_id),
                member: connection_id.to_string(),
            });
        }
        ops.push(KvOp::Del {
            key: peer_key(connection_id),
        });

        self.kv.apply(ops).await
    }

    /// Drop room-level keys once the room's router is gone.
    pub async fn cleanup_room(&self, room_id: Uuid) -> Result<(), StoreError> {
        self.kv
            .apply(vec![
                KvOp::Del {
                    key: room_router_key(room_id),
                },
                KvOp::Del {
                    key: room_peers_key(room_id),
                },
            ])
            .await
    }

    async fn read_record<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.kv.get(key).await? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(record) => Ok(Some(record)),
                Err(err) => {
                    tracing::warn!("Dropping malformed record at {key}: {err}");
                    self.kv
                        .apply(vec![KvOp::Del { key: key.to_string() }])
                        .await?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Fetch the records behind a set of ids, pruning members whose
    /// records are missing or malformed.
    async fn read_set_records<T: serde::de::DeserializeOwned>(
        &self,
        set_key: &str,
        record_key: fn(Uuid) -> String,
    ) -> Result<Vec<T>, StoreError> {
        let members = self.kv.smembers(set_key).await?;
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(members.len());
        let mut prune = Vec::new();
        for member in &members {
            match member.parse::<Uuid>() {
                Ok(id) => ids.push(id),
                Err(_) => prune.push(KvOp::SRem {
                    key: set_key.to_string(),
                    member: member.clone(),
                }),
            }
        }

        let keys: Vec<String> = ids.iter().map(|id| record_key(*id)).collect();
        let raws = self.kv.mget(&keys).await?;

        let mut records = Vec::with_capacity(ids.len());
        for (id, raw) in ids.into_iter().zip(raws) {
            let parsed = raw.as_deref().map(serde_json::from_str::<T>);
            match parsed {
                Some(Ok(record)) => records.push(record),
                Some(Err(err)) => {
                    tracing::warn!("Dropping malformed record at {}: {err}", record_key(id));
                    prune.push(KvOp::Del { key: record_key(id) });
                    prune.push(KvOp::SRem {
                        key: set_key.to_string(),
                        member: id.to_string(),
                    });
                }
                None => {
                    prune.push(KvOp::SRem {
                        key: set_key.to_string(),
                        member: id.to_string(),
                    });
                }
            }
        }

        if !prune.is_empty() {
            self.kv.apply(prune).await?;
        }
        Ok(records)
    }
}
